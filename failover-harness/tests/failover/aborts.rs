//! Runs that must abort, and what they leave behind.

use std::time::Duration;

use failover_harness::{HarnessError, InvocationError, NodeId, TimingConfig, TopologyError};

use super::{four_node_cluster, four_node_test, init_tracing};

/// Assert the driver is no longer invoking the service.
async fn assert_quiescent(cluster: &failover_harness::SimCluster) {
    let calls = cluster.calls();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(cluster.calls(), calls, "driver still running after abort");
}

#[tokio::test(start_paused = true)]
async fn test_failure_during_checked_outage_names_the_node() {
    init_tracing();
    let cluster = four_node_cluster();
    cluster.fail_while_stopped(&NodeId::new("clusterA-node0"));
    let mut test = four_node_test(&cluster, TimingConfig::default());

    let err = test.run().await.expect_err("outage failures must surface");
    match &err {
        HarnessError::CorrectnessViolation { label, failure, .. } => {
            assert_eq!(label, "after clusterA-node0 was shut down");
            assert!(matches!(failure, InvocationError::Remote(msg) if msg.contains("clusterA-node0")));
        }
        other => panic!("expected a correctness violation, got {other:?}"),
    }
    assert!(err.is_correctness());

    // Aborted before the restart.
    assert_eq!(cluster.stops(), 1);
    assert_eq!(cluster.starts(), 0);
    assert_eq!(cluster.releases(), 1);
    assert_quiescent(&cluster).await;
}

#[tokio::test(start_paused = true)]
async fn test_failure_in_unchecked_outage_surfaces_after_restart() {
    let cluster = four_node_cluster();
    cluster.fail_while_stopped(&NodeId::new("clusterA-node1"));
    let mut test = four_node_test(&cluster, TimingConfig::default());

    let err = test.run().await.expect_err("latched failure must surface");
    match err {
        HarnessError::CorrectnessViolation { label, .. } => {
            assert_eq!(label, "after clusterA-node1 was brought back up");
        }
        other => panic!("expected a correctness violation, got {other:?}"),
    }
    assert_eq!(cluster.starts(), 2);
    assert_eq!(cluster.releases(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_first_failure_is_reported_not_the_latest() {
    let cluster = four_node_cluster();
    let mut test = four_node_test(&cluster, TimingConfig::default());

    // Three failures during the baseline window.
    let injector = {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(7_050)).await;
            cluster.fail_next(3);
        })
    };

    let err = test.run().await.expect_err("baseline failure");
    injector.await.expect("injector task");
    match err {
        HarnessError::CorrectnessViolation {
            label,
            sequence,
            failure,
        } => {
            assert_eq!(label, "at the beginning of the test");
            // Driver started at 5s; first call after 7.05s is tick #22.
            assert_eq!(sequence, 22);
            assert_eq!(failure, InvocationError::Remote("injected failure".into()));
        }
        other => panic!("expected a correctness violation, got {other:?}"),
    }
    assert_eq!(cluster.stops(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_warm_up_failure() {
    let cluster = four_node_cluster();
    cluster.fail_next(1);
    let mut test = four_node_test(&cluster, TimingConfig::default());

    let err = test.run().await.expect_err("warm-up fails");
    assert!(matches!(err, HarnessError::WarmUp(_)));
    assert_eq!(cluster.calls(), 1);
    assert_eq!(cluster.releases(), 1);
    assert_quiescent(&cluster).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_exceeding_grace_period_is_infrastructure_fault() {
    let cluster = four_node_cluster();
    let node = NodeId::new("clusterB-node0");
    cluster.hang_on_stop(&node);
    let timing = TimingConfig::default().with_grace_period(Duration::from_millis(800));
    let mut test = four_node_test(&cluster, timing);

    let err = test.run().await.expect_err("stop never completes");
    assert_eq!(
        err,
        HarnessError::Topology(TopologyError::GracePeriodExceeded {
            node: node.clone(),
            grace: Duration::from_millis(800),
        })
    );
    assert!(err.is_infrastructure());
    assert!(!err.is_correctness());

    assert_eq!(cluster.stops(), 2);
    assert_eq!(cluster.starts(), 2);
    assert!(cluster.is_running(&node));
    assert_eq!(cluster.releases(), 1);
    assert_quiescent(&cluster).await;
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_aborts() {
    let cluster = four_node_cluster();
    let node = NodeId::new("clusterA-node0");
    cluster.refuse_start(&node);
    let mut test = four_node_test(&cluster, TimingConfig::default());

    let err = test.run().await.expect_err("start refused");
    assert!(matches!(
        err,
        HarnessError::Topology(TopologyError::StartFailed { .. })
    ));
    assert_eq!(cluster.releases(), 1);
    assert_quiescent(&cluster).await;
}

#[tokio::test(start_paused = true)]
async fn test_acquisition_failure_runs_nothing() {
    let cluster = four_node_cluster();
    cluster.fail_acquisition();
    let mut test = four_node_test(&cluster, TimingConfig::default());

    let err = test.run().await.expect_err("no handle");
    assert!(matches!(err, HarnessError::Acquisition(_)));
    assert!(err.is_infrastructure());
    assert_eq!(cluster.calls(), 0);
    assert_eq!(cluster.releases(), 0);
    assert_eq!(cluster.stops(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_timing_is_rejected_before_acquisition() {
    let cluster = four_node_cluster();
    let timing = TimingConfig::default().with_outage_window(Duration::ZERO);
    let mut test = four_node_test(&cluster, timing);

    assert!(matches!(
        test.initialize(),
        Err(HarnessError::InvalidConfig(_))
    ));
    assert!(matches!(
        test.run().await,
        Err(HarnessError::InvalidConfig(_))
    ));
    assert_eq!(cluster.acquisitions(), 0);
}
