//! Toggle script generation and validation.
//!
//! A [`Script`] is the foreground timeline of a run once the driver is going:
//! timed waits, node stops and starts, and labelled checkpoints. Generating
//! it up front lets the "never take a whole sub-cluster down" rule be checked
//! before any node is touched.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::config::TimingConfig;
use crate::error::TopologyError;
use crate::topology::{ClusterTopology, NodeId};

/// Which interval a wait represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Failure-free interval before the first toggle.
    Stability,
    /// A node is deliberately down.
    Outage,
    /// A restarted node rejoins the cluster.
    Convergence,
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowKind::Stability => f.write_str("stability"),
            WindowKind::Outage => f.write_str("outage"),
            WindowKind::Convergence => f.write_str("convergence"),
        }
    }
}

/// When to assert right after a stop, before the node is restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutageCheckpoints {
    /// Only after stopping the first member of each sub-cluster. Outages of
    /// the other members are unchecked windows; a failure latched there still
    /// surfaces at the checkpoint after the restart.
    #[default]
    FirstPerSubCluster,
    /// After every stop.
    Every,
}

/// One step of the scripted timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Sleep through a window.
    Wait {
        /// What the window is for.
        kind: WindowKind,
        /// How long to wait.
        duration: Duration,
    },
    /// Stop a node gracefully.
    Stop(NodeId),
    /// Start a stopped node.
    Start(NodeId),
    /// Assert that no invocation has failed so far.
    Checkpoint(String),
}

/// The ordered steps of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    steps: Vec<ScriptStep>,
}

/// Label of the baseline checkpoint.
pub const BASELINE_LABEL: &str = "at the beginning of the test";

/// Label of the checkpoint taken while `node` is down.
pub fn stopped_label(node: &NodeId) -> String {
    format!("after {node} was shut down")
}

/// Label of the checkpoint taken after `node` has been restarted.
pub fn restarted_label(node: &NodeId) -> String {
    format!("after {node} was brought back up")
}

impl Script {
    /// Build a script from explicit steps.
    pub fn from_steps(steps: Vec<ScriptStep>) -> Self {
        Self { steps }
    }

    /// The standard toggle script for `topology`.
    ///
    /// Stability window and baseline checkpoint, then for every node of both
    /// sub-clusters in order: stop, outage window, optional checkpoint,
    /// start, convergence window, checkpoint. At most one node is down at a
    /// time.
    pub fn generate(
        topology: &ClusterTopology,
        timing: &TimingConfig,
        outage_checkpoints: OutageCheckpoints,
    ) -> Self {
        let mut steps = vec![
            ScriptStep::Wait {
                kind: WindowKind::Stability,
                duration: timing.stability_window,
            },
            ScriptStep::Checkpoint(BASELINE_LABEL.to_string()),
        ];

        for sub_cluster in topology.sub_clusters() {
            for (index, node) in sub_cluster.members().iter().enumerate() {
                steps.push(ScriptStep::Stop(node.clone()));
                steps.push(ScriptStep::Wait {
                    kind: WindowKind::Outage,
                    duration: timing.outage_window,
                });
                let check_outage = match outage_checkpoints {
                    OutageCheckpoints::Every => true,
                    OutageCheckpoints::FirstPerSubCluster => index == 0,
                };
                if check_outage {
                    steps.push(ScriptStep::Checkpoint(stopped_label(node)));
                }
                steps.push(ScriptStep::Start(node.clone()));
                steps.push(ScriptStep::Wait {
                    kind: WindowKind::Convergence,
                    duration: timing.convergence_window,
                });
                steps.push(ScriptStep::Checkpoint(restarted_label(node)));
            }
        }

        Self { steps }
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }

    /// Checkpoint labels in execution order.
    pub fn checkpoints(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|step| match step {
            ScriptStep::Checkpoint(label) => Some(label.as_str()),
            _ => None,
        })
    }

    /// Total time spent in waits.
    pub fn total_wait(&self) -> Duration {
        self.steps
            .iter()
            .map(|step| match step {
                ScriptStep::Wait { duration, .. } => *duration,
                _ => Duration::ZERO,
            })
            .sum()
    }

    /// Replay the script against `topology` without touching any node.
    ///
    /// Fails if a step names an unknown node, stops a stopped node, starts a
    /// running one, would leave a sub-cluster with no running member, or if
    /// any node is still down when the script ends.
    pub fn validate(&self, topology: &ClusterTopology) -> Result<(), TopologyError> {
        let mut stopped: BTreeSet<&NodeId> = BTreeSet::new();

        for step in &self.steps {
            match step {
                ScriptStep::Stop(node) => {
                    let sub_cluster = topology
                        .sub_cluster_of(node)
                        .ok_or_else(|| TopologyError::UnknownNode(node.clone()))?;
                    if !stopped.insert(node) {
                        return Err(TopologyError::AlreadyStopped(node.clone()));
                    }
                    let any_running = sub_cluster.members().iter().any(|m| !stopped.contains(m));
                    if !any_running {
                        return Err(TopologyError::WouldIsolate {
                            node: node.clone(),
                            sub_cluster: sub_cluster.name().to_string(),
                        });
                    }
                }
                ScriptStep::Start(node) => {
                    if !topology.contains(node) {
                        return Err(TopologyError::UnknownNode(node.clone()));
                    }
                    if !stopped.remove(node) {
                        return Err(TopologyError::AlreadyRunning(node.clone()));
                    }
                }
                ScriptStep::Wait { .. } | ScriptStep::Checkpoint(_) => {}
            }
        }

        if let Some(node) = stopped.into_iter().next() {
            return Err(TopologyError::InvalidTopology(format!(
                "script ends with {node} still stopped"
            )));
        }
        Ok(())
    }
}
