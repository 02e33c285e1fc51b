//! Error types for the failover harness.
//!
//! Errors are split by who is at fault: [`InvocationError`] is a single
//! client-observable failure of the service under test and is never fatal on
//! its own; [`TopologyError`] and [`ServiceError`] are infrastructure faults;
//! [`HarnessError`] is what a run ultimately reports.

use std::time::Duration;

use thiserror::Error;

use crate::time::TimeError;
use crate::topology::NodeId;

/// A failed call against the service under test.
///
/// Recorded by the consistency monitor, latched if it is the first one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// No member able to serve the request was reachable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the invocation timeout.
    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),

    /// The remote side reported an error.
    #[error("remote failure: {0}")]
    Remote(String),
}

/// Errors related to acquiring or using a service handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Looking up the requested implementation failed.
    #[error("lookup of '{implementation}' failed: {reason}")]
    LookupFailed {
        /// Implementation identifier that was requested.
        implementation: String,
        /// Why the lookup failed.
        reason: String,
    },

    /// The directory handing out handles has already been closed.
    #[error("service directory closed")]
    Closed,
}

/// Errors related to the cluster topology and node control.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// The topology does not have the required two-sub-cluster shape.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// The node is not a member of the topology.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// Stop requested for a node that is already stopped.
    #[error("node {0} is already stopped")]
    AlreadyStopped(NodeId),

    /// Start requested for a node that is already running.
    #[error("node {0} is already running")]
    AlreadyRunning(NodeId),

    /// Stopping the node would leave its sub-cluster without a running member.
    #[error("stopping {node} would leave sub-cluster {sub_cluster} with no running member")]
    WouldIsolate {
        /// Node whose stop was refused.
        node: NodeId,
        /// Sub-cluster that would become unreachable.
        sub_cluster: String,
    },

    /// The node did not shut down within its grace period.
    #[error("node {node} did not stop within its grace period of {grace:?}")]
    GracePeriodExceeded {
        /// Node that failed to stop.
        node: NodeId,
        /// Grace period that was allowed.
        grace: Duration,
    },

    /// The controller reported a failure stopping the node.
    #[error("failed to stop {node}: {reason}")]
    StopFailed {
        /// Node that failed to stop.
        node: NodeId,
        /// Controller-provided reason.
        reason: String,
    },

    /// The controller reported a failure starting the node.
    #[error("failed to start {node}: {reason}")]
    StartFailed {
        /// Node that failed to start.
        node: NodeId,
        /// Controller-provided reason.
        reason: String,
    },
}

/// Fatal outcome of a harness run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HarnessError {
    /// A checkpoint found a latched invocation failure.
    #[error("client threw an exception {label}: invocation #{sequence} failed: {failure}")]
    CorrectnessViolation {
        /// Checkpoint label identifying the phase and node.
        label: String,
        /// Driver-local sequence number of the first failed invocation.
        sequence: u64,
        /// The first failure observed, retained by the latch.
        failure: InvocationError,
    },

    /// Node control did not honor its contract.
    #[error("topology control failed: {0}")]
    Topology(#[from] TopologyError),

    /// The service handle could not be acquired.
    #[error("service acquisition failed: {0}")]
    Acquisition(#[from] ServiceError),

    /// The synchronous warm-up invocation failed.
    #[error("warm-up invocation failed: {0}")]
    WarmUp(InvocationError),

    /// Timing or script configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation was requested in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The time provider failed.
    #[error("time provider error: {0}")]
    Time(#[from] TimeError),
}

impl HarnessError {
    /// Whether this is a client-observable correctness failure.
    pub fn is_correctness(&self) -> bool {
        matches!(
            self,
            HarnessError::CorrectnessViolation { .. } | HarnessError::WarmUp(_)
        )
    }

    /// Whether this is an infrastructure fault (node control, acquisition, timing).
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            HarnessError::Topology(_) | HarnessError::Acquisition(_) | HarnessError::Time(_)
        )
    }
}

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;
