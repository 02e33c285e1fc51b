//! Cluster topology and node control.
//!
//! The cluster under test is a fixed set of nodes partitioned into exactly two
//! named sub-clusters of equal size. Node control itself is an external
//! collaborator behind [`TopologyController`]; [`TrackedTopology`] wraps it,
//! tracks which nodes are running, enforces the grace period, and refuses any
//! stop that would leave a sub-cluster without a running member.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::TopologyError;
use crate::time::TimeProvider;

/// Identifier of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Whether a node is currently serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The node is up.
    Running,
    /// The node was stopped by the harness.
    Stopped,
}

/// One named group of nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubCluster {
    name: String,
    members: Vec<NodeId>,
}

impl SubCluster {
    /// Create a sub-cluster from its name and members, in toggle order.
    pub fn new(name: impl Into<String>, members: Vec<NodeId>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }

    /// Sub-cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Members in toggle order.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Whether `node` belongs to this sub-cluster.
    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }
}

/// Two sub-clusters of equal size, at least two nodes each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    sub_clusters: [SubCluster; 2],
}

impl ClusterTopology {
    /// Build a topology, validating its shape.
    pub fn new(first: SubCluster, second: SubCluster) -> Result<Self, TopologyError> {
        if first.name == second.name {
            return Err(TopologyError::InvalidTopology(format!(
                "sub-cluster names must differ, both are '{}'",
                first.name
            )));
        }
        if first.members.len() != second.members.len() {
            return Err(TopologyError::InvalidTopology(format!(
                "sub-clusters must be the same size: {} has {}, {} has {}",
                first.name,
                first.members.len(),
                second.name,
                second.members.len()
            )));
        }
        if first.members.len() < 2 {
            return Err(TopologyError::InvalidTopology(format!(
                "each sub-cluster needs at least 2 nodes to survive a single outage, got {}",
                first.members.len()
            )));
        }

        let mut seen = BTreeSet::new();
        for node in first.members.iter().chain(second.members.iter()) {
            if !seen.insert(node) {
                return Err(TopologyError::InvalidTopology(format!(
                    "node {node} appears more than once"
                )));
            }
        }

        Ok(Self {
            sub_clusters: [first, second],
        })
    }

    /// The standard four-node layout: `clusterA` and `clusterB` with two nodes each.
    pub fn four_nodes() -> Self {
        Self {
            sub_clusters: [named_sub_cluster("clusterA", 2), named_sub_cluster("clusterB", 2)],
        }
    }

    /// `clusterA` and `clusterB` with `nodes_per_sub_cluster` nodes each.
    pub fn symmetric(nodes_per_sub_cluster: usize) -> Result<Self, TopologyError> {
        Self::new(
            named_sub_cluster("clusterA", nodes_per_sub_cluster),
            named_sub_cluster("clusterB", nodes_per_sub_cluster),
        )
    }

    /// Both sub-clusters, in toggle order.
    pub fn sub_clusters(&self) -> &[SubCluster; 2] {
        &self.sub_clusters
    }

    /// The sub-cluster `node` belongs to.
    pub fn sub_cluster_of(&self, node: &NodeId) -> Option<&SubCluster> {
        self.sub_clusters.iter().find(|sc| sc.contains(node))
    }

    /// All nodes, sub-cluster by sub-cluster.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.sub_clusters.iter().flat_map(|sc| sc.members.iter())
    }

    /// Whether `node` is part of the topology.
    pub fn contains(&self, node: &NodeId) -> bool {
        self.sub_cluster_of(node).is_some()
    }

    /// Total number of nodes.
    pub fn len(&self) -> usize {
        self.sub_clusters.iter().map(|sc| sc.members.len()).sum()
    }

    /// Always false; a valid topology has at least four nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn named_sub_cluster(name: &str, size: usize) -> SubCluster {
    let members = (0..size)
        .map(|i| NodeId::new(format!("{name}-node{i}")))
        .collect();
    SubCluster::new(name, members)
}

/// Stop/start primitives over the cluster members (external collaborator).
#[async_trait]
pub trait TopologyController: Send + Sync {
    /// Request an orderly shutdown, allowing up to `grace` to drain in-flight work.
    async fn stop(&self, node: &NodeId, grace: Duration) -> Result<(), TopologyError>;

    /// Request the node rejoin the topology.
    ///
    /// Does not wait for the node to converge into cluster membership.
    async fn start(&self, node: &NodeId) -> Result<(), TopologyError>;
}

/// A [`TopologyController`] plus the harness's view of which nodes are up.
pub struct TrackedTopology<C, T> {
    controller: C,
    topology: ClusterTopology,
    states: BTreeMap<NodeId, NodeState>,
    time: T,
}

impl<C, T> TrackedTopology<C, T>
where
    C: TopologyController,
    T: TimeProvider,
{
    /// Track `topology`, all nodes initially running.
    pub fn new(controller: C, topology: ClusterTopology, time: T) -> Self {
        let states = topology
            .nodes()
            .map(|node| (node.clone(), NodeState::Running))
            .collect();
        Self {
            controller,
            topology,
            states,
            time,
        }
    }

    /// The tracked topology.
    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    /// The wrapped controller.
    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Current state of `node`.
    pub fn state(&self, node: &NodeId) -> Option<NodeState> {
        self.states.get(node).copied()
    }

    /// Nodes currently stopped.
    pub fn stopped(&self) -> impl Iterator<Item = &NodeId> {
        self.states
            .iter()
            .filter(|(_, state)| **state == NodeState::Stopped)
            .map(|(node, _)| node)
    }

    /// Stop `node` gracefully.
    ///
    /// Fails without contacting the controller if the node is unknown, already
    /// stopped, or the last running member of its sub-cluster. Fails with
    /// [`TopologyError::GracePeriodExceeded`] if the controller does not
    /// complete within `grace`.
    pub async fn stop(&mut self, node: &NodeId, grace: Duration) -> Result<(), TopologyError> {
        let sub_cluster = self
            .topology
            .sub_cluster_of(node)
            .ok_or_else(|| TopologyError::UnknownNode(node.clone()))?;

        if self.state(node) == Some(NodeState::Stopped) {
            return Err(TopologyError::AlreadyStopped(node.clone()));
        }

        let running_siblings = sub_cluster
            .members()
            .iter()
            .filter(|m| *m != node && self.state(m) == Some(NodeState::Running))
            .count();
        if running_siblings == 0 {
            return Err(TopologyError::WouldIsolate {
                node: node.clone(),
                sub_cluster: sub_cluster.name().to_string(),
            });
        }

        info!("------ Shutdown {} -----", node);
        match self
            .time
            .timeout(grace, self.controller.stop(node, grace))
            .await
        {
            Ok(Ok(())) => {
                self.states.insert(node.clone(), NodeState::Stopped);
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!("node {} did not stop within {:?}", node, grace);
                Err(TopologyError::GracePeriodExceeded {
                    node: node.clone(),
                    grace,
                })
            }
        }
    }

    /// Start a stopped `node`.
    pub async fn start(&mut self, node: &NodeId) -> Result<(), TopologyError> {
        match self.state(node) {
            None => return Err(TopologyError::UnknownNode(node.clone())),
            Some(NodeState::Running) => return Err(TopologyError::AlreadyRunning(node.clone())),
            Some(NodeState::Stopped) => {}
        }

        info!("------ Startup {} -----", node);
        self.controller.start(node).await?;
        self.states.insert(node.clone(), NodeState::Running);
        Ok(())
    }
}
