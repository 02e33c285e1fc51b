//! Runs that are expected to pass.

use std::time::Duration;

use failover_harness::{ClusterTopology, OutageCheckpoints, TimingConfig};

use super::{four_node_cluster, four_node_test, init_tracing, IMPLEMENTATION};

#[tokio::test(start_paused = true)]
async fn test_four_node_toggle_passes() {
    init_tracing();
    let cluster = four_node_cluster();
    let mut test = four_node_test(&cluster, TimingConfig::default());

    let report = test.run().await.expect("healthy cluster must pass");
    println!("{report}");

    assert_eq!(report.implementation, IMPLEMENTATION);
    assert_eq!(
        report.checkpoints,
        vec![
            "at the beginning of the test",
            "after clusterA-node0 was shut down",
            "after clusterA-node0 was brought back up",
            "after clusterA-node1 was brought back up",
            "after clusterB-node0 was shut down",
            "after clusterB-node0 was brought back up",
            "after clusterB-node1 was brought back up",
        ]
    );

    // 45s of scripted windows at a 100ms period.
    let invocations = report.monitor.invocations;
    assert!((449..=452).contains(&invocations), "got {invocations}");
    assert_eq!(report.monitor.failures, 0);
    assert_eq!(report.monitor.resyncs, 0);
    assert!(report.monitor.first_failure.is_none());
    assert_eq!(report.seed, 0);
    assert_eq!(report.monitor.expected, invocations as i64);

    // convergence + stability + 4 x (outage + convergence)
    assert!(report.elapsed >= Duration::from_millis(50_000));
    assert!(report.elapsed < Duration::from_millis(50_100));

    assert_eq!(cluster.acquisitions(), 1);
    assert_eq!(cluster.releases(), 1);
    assert_eq!(cluster.stops(), 4);
    assert_eq!(cluster.starts(), 4);
    for node in ClusterTopology::four_nodes().nodes() {
        assert!(cluster.is_running(node));
    }
}

#[tokio::test(start_paused = true)]
async fn test_driver_is_cancelled_after_run() {
    let cluster = four_node_cluster();
    let mut test = four_node_test(&cluster, TimingConfig::default());
    test.run().await.expect("pass");

    let calls = cluster.calls();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cluster.calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_baseline_window_count() {
    let cluster = four_node_cluster();
    let timing = TimingConfig::default();
    let mut test = four_node_test(&cluster, timing.clone());

    // Sample the cluster just before the first stop: acquisition and
    // convergence take 5s, the warm-up is one call, the baseline window 5s.
    let probe = {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(9_990)).await;
            cluster.calls()
        })
    };

    test.run().await.expect("pass");
    let calls_at_baseline = probe.await.expect("probe task");
    let driver_calls = calls_at_baseline - 1;
    assert!(
        (49..=51).contains(&driver_calls),
        "got {driver_calls} invocations in the stability window"
    );
}

#[tokio::test(start_paused = true)]
async fn test_every_outage_checkpoint_policy() {
    let cluster = four_node_cluster();
    let mut test = four_node_test(&cluster, TimingConfig::default())
        .with_outage_checkpoints(OutageCheckpoints::Every);

    let report = test.run().await.expect("pass");
    assert_eq!(report.checkpoints.len(), 9);
    assert!(report
        .checkpoints
        .contains(&"after clusterB-node1 was shut down".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_renumbering_is_resynchronized_not_failed() {
    init_tracing();
    let cluster = four_node_cluster();
    let mut test = four_node_test(&cluster, TimingConfig::default());

    // Jump the counter while clusterA-node0 is down.
    let injector = {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(12_050)).await;
            cluster.renumber(7);
        })
    };

    let report = test.run().await.expect("a renumbering is not a failure");
    injector.await.expect("injector task");

    assert_eq!(report.monitor.resyncs, 1);
    assert_eq!(report.monitor.failures, 0);
    assert_eq!(report.monitor.expected, report.monitor.invocations as i64 + 7);
}

#[tokio::test(start_paused = true)]
async fn test_slow_service_still_passes() {
    let cluster = four_node_cluster();
    cluster.set_latency(Duration::from_millis(150));
    let mut test = four_node_test(&cluster, TimingConfig::default());

    let report = test.run().await.expect("latency is not a failure");
    // Each tick is 150ms call + 100ms delay.
    let invocations = report.monitor.invocations;
    assert!((178..=182).contains(&invocations), "got {invocations}");
}

#[tokio::test(start_paused = true)]
async fn test_scaled_timing() {
    let cluster = four_node_cluster();
    let timing = TimingConfig::default().scaled(20);
    assert_eq!(timing.stability_window, Duration::from_millis(1000));
    assert_eq!(timing.invocation_period, Duration::from_millis(20));

    let mut test = four_node_test(&cluster, timing);
    let report = test.run().await.expect("pass");
    assert!(report.elapsed >= Duration::from_millis(10_000));
    assert!(report.elapsed < Duration::from_millis(10_100));
    assert!(report.monitor.invocations >= 449);
}
