//! In-process simulated two-sub-cluster service.
//!
//! Stands in for the external collaborators so the harness can be exercised
//! end to end: a counter service whose requests are accepted by a running
//! member of the first sub-cluster and forwarded to a running member of the
//! second, plus node control over the same members.
//!
//! Faults are injected explicitly:
//!
//! | Knob | Effect |
//! |------|--------|
//! | [`fail_next`](SimCluster::fail_next) | next N invocations fail |
//! | [`fail_while_stopped`](SimCluster::fail_while_stopped) | invocations fail while the node is down |
//! | [`renumber`](SimCluster::renumber) | counter jumps forward once |
//! | [`set_latency`](SimCluster::set_latency) | every invocation takes this long |
//! | [`hang_on_stop`](SimCluster::hang_on_stop) | stopping the node never completes |
//! | [`refuse_start`](SimCluster::refuse_start) | starting the node fails |
//! | [`fail_acquisition`](SimCluster::fail_acquisition) | the factory refuses to hand out handles |

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{InvocationError, ServiceError, TopologyError};
use crate::service::{factory_fn, ServiceFactory, ServiceHandle};
use crate::topology::{ClusterTopology, NodeId, TopologyController};

#[derive(Debug)]
struct SimState {
    topology: ClusterTopology,
    stopped: BTreeSet<NodeId>,
    counter: i64,
    calls: u64,
    fail_next: u32,
    fail_while_stopped: BTreeSet<NodeId>,
    pending_jump: i64,
    latency: Duration,
    hang_on_stop: BTreeSet<NodeId>,
    refuse_start: BTreeSet<NodeId>,
    fail_acquisition: bool,
    acquisitions: u32,
    releases: u32,
    stops: u32,
    starts: u32,
}

/// Shared simulated cluster; clones see the same state.
#[derive(Debug, Clone)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// A healthy cluster over `topology` with the counter at zero.
    pub fn new(topology: ClusterTopology) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                topology,
                stopped: BTreeSet::new(),
                counter: 0,
                calls: 0,
                fail_next: 0,
                fail_while_stopped: BTreeSet::new(),
                pending_jump: 0,
                latency: Duration::ZERO,
                hang_on_stop: BTreeSet::new(),
                refuse_start: BTreeSet::new(),
                fail_acquisition: false,
                acquisitions: 0,
                releases: 0,
                stops: 0,
                starts: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handle to the counter service. Not counted as an acquisition.
    pub fn handle(&self) -> Arc<dyn ServiceHandle> {
        Arc::new(SimHandle {
            cluster: self.clone(),
        })
    }

    /// A factory handing out handles for any implementation name.
    pub fn factory(&self) -> Arc<dyn ServiceFactory> {
        let cluster = self.clone();
        factory_fn(move |implementation| {
            let cluster = cluster.clone();
            async move {
                let mut state = cluster.lock();
                if state.fail_acquisition {
                    return Err(ServiceError::LookupFailed {
                        implementation,
                        reason: "simulated lookup failure".into(),
                    });
                }
                state.acquisitions += 1;
                drop(state);
                Ok(cluster.handle())
            }
        })
    }

    /// A controller for the cluster's nodes.
    pub fn controller(&self) -> SimController {
        SimController {
            cluster: self.clone(),
        }
    }

    /// Fail the next `count` invocations.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    /// Fail invocations while `node` is stopped.
    pub fn fail_while_stopped(&self, node: &NodeId) {
        self.lock().fail_while_stopped.insert(node.clone());
    }

    /// Skip `jump` values before the next invocation is served.
    pub fn renumber(&self, jump: i64) {
        self.lock().pending_jump += jump;
    }

    /// Delay every invocation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Make stopping `node` never complete.
    pub fn hang_on_stop(&self, node: &NodeId) {
        self.lock().hang_on_stop.insert(node.clone());
    }

    /// Make starting `node` fail.
    pub fn refuse_start(&self, node: &NodeId) {
        self.lock().refuse_start.insert(node.clone());
    }

    /// Make the factory fail.
    pub fn fail_acquisition(&self) {
        self.lock().fail_acquisition = true;
    }

    /// Current counter value (the next value to hand out).
    pub fn counter(&self) -> i64 {
        self.lock().counter
    }

    /// Invocations received, served or not.
    pub fn calls(&self) -> u64 {
        self.lock().calls
    }

    /// Handles handed out by the factory.
    pub fn acquisitions(&self) -> u32 {
        self.lock().acquisitions
    }

    /// Handle releases observed.
    pub fn releases(&self) -> u32 {
        self.lock().releases
    }

    /// Completed stop requests.
    pub fn stops(&self) -> u32 {
        self.lock().stops
    }

    /// Completed start requests.
    pub fn starts(&self) -> u32 {
        self.lock().starts
    }

    /// Whether `node` is up.
    pub fn is_running(&self, node: &NodeId) -> bool {
        !self.lock().stopped.contains(node)
    }

    fn serve(&self) -> Result<i64, InvocationError> {
        let mut state = self.lock();
        state.calls += 1;

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(InvocationError::Remote("injected failure".into()));
        }
        if let Some(node) = state
            .fail_while_stopped
            .iter()
            .find(|n| state.stopped.contains(*n))
        {
            return Err(InvocationError::Remote(format!(
                "session state lost with {node}"
            )));
        }
        // Accepted by one sub-cluster, forwarded to the other: both need a
        // running member.
        for sub_cluster in state.topology.sub_clusters() {
            if sub_cluster
                .members()
                .iter()
                .all(|m| state.stopped.contains(m))
            {
                return Err(InvocationError::Unavailable(format!(
                    "no running member in {}",
                    sub_cluster.name()
                )));
            }
        }

        let jump = std::mem::take(&mut state.pending_jump);
        state.counter += jump;
        let value = state.counter;
        state.counter += 1;
        Ok(value)
    }
}

struct SimHandle {
    cluster: SimCluster,
}

#[async_trait]
impl ServiceHandle for SimHandle {
    async fn fetch_and_increment(&self) -> Result<i64, InvocationError> {
        let latency = self.cluster.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.cluster.serve()
    }

    fn release(&self) {
        self.cluster.lock().releases += 1;
    }
}

/// [`TopologyController`] over a [`SimCluster`].
#[derive(Debug, Clone)]
pub struct SimController {
    cluster: SimCluster,
}

#[async_trait]
impl TopologyController for SimController {
    async fn stop(&self, node: &NodeId, _grace: Duration) -> Result<(), TopologyError> {
        let hang = {
            let state = self.cluster.lock();
            if !state.topology.contains(node) {
                return Err(TopologyError::UnknownNode(node.clone()));
            }
            state.hang_on_stop.contains(node)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.cluster.lock();
        state.stopped.insert(node.clone());
        state.stops += 1;
        debug!("simulated node {} stopped", node);
        Ok(())
    }

    async fn start(&self, node: &NodeId) -> Result<(), TopologyError> {
        let mut state = self.cluster.lock();
        if state.refuse_start.contains(node) {
            return Err(TopologyError::StartFailed {
                node: node.clone(),
                reason: "simulated start failure".into(),
            });
        }
        state.stopped.remove(node);
        state.starts += 1;
        debug!("simulated node {} started", node);
        Ok(())
    }
}
