//! Consistency monitor: the running verdict of a harness run.
//!
//! The driver task records every invocation outcome here while the
//! orchestrator reads the verdict at each checkpoint. All state lives behind a
//! single mutex so a value written by the driver is visible to the next
//! orchestrator read.
//!
//! Two policies apply:
//! - An unexpected but successful counter value is a *resynchronization*: it
//!   is logged and counted, and `expected` jumps to the observed value. Values
//!   may be renumbered or reordered under failover.
//! - Failures are *latched*: only the first one is kept, later ones are only
//!   counted.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};

use crate::error::{HarnessError, HarnessResult, InvocationError};

/// Result of one request issued by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationOutcome {
    /// Driver-local sequence number, starting at 1.
    pub sequence: u64,
    /// Counter value returned by the service, or the failure.
    pub result: Result<i64, InvocationError>,
}

impl InvocationOutcome {
    /// A successful invocation that returned `value`.
    pub fn success(sequence: u64, value: i64) -> Self {
        Self {
            sequence,
            result: Ok(value),
        }
    }

    /// A failed invocation.
    pub fn failure(sequence: u64, error: InvocationError) -> Self {
        Self {
            sequence,
            result: Err(error),
        }
    }
}

/// The first failure the monitor observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatchedFailure {
    /// Sequence number of the failed invocation.
    pub sequence: u64,
    /// The failure itself.
    pub error: InvocationError,
}

/// How a recorded outcome affected the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The value was exactly `expected + 1`.
    InOrder,
    /// The value was unexpected; `expected` was reset to it.
    Resynchronized {
        /// The value the monitor expected.
        expected: i64,
        /// The value actually received.
        received: i64,
    },
    /// The invocation failed. `latched` is true if this became the first failure.
    Failed {
        /// Whether this failure was stored by the latch.
        latched: bool,
    },
}

/// Point-in-time copy of the monitor state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSnapshot {
    /// Last counter value accepted.
    pub expected: i64,
    /// Outcomes recorded so far.
    pub invocations: u64,
    /// Failed outcomes recorded so far, latched or not.
    pub failures: u64,
    /// Resynchronization events so far.
    pub resyncs: u64,
    /// The latched first failure, if any.
    pub first_failure: Option<LatchedFailure>,
}

#[derive(Debug)]
struct MonitorState {
    expected: i64,
    invocations: u64,
    failures: u64,
    resyncs: u64,
    first_failure: Option<LatchedFailure>,
}

/// Tracks expected counter progression and the first failure.
///
/// Shared between the driver and the orchestrator behind an `Arc`.
#[derive(Debug)]
pub struct ConsistencyMonitor {
    state: Mutex<MonitorState>,
}

impl ConsistencyMonitor {
    /// Create a monitor seeded with the value returned by the warm-up invocation.
    ///
    /// The next in-order value is `seed + 1`.
    pub fn new(seed: i64) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                expected: seed,
                invocations: 0,
                failures: 0,
                resyncs: 0,
                first_failure: None,
            }),
        }
    }

    // Mutations are plain field stores; a poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one invocation outcome.
    pub fn record(&self, outcome: InvocationOutcome) -> Progress {
        let mut state = self.lock();
        state.invocations += 1;

        match outcome.result {
            Ok(value) => {
                let next = state.expected.wrapping_add(1);
                if value == next {
                    debug!(
                        "invocation #{} received serial #{}",
                        outcome.sequence, value
                    );
                    state.expected = value;
                    Progress::InOrder
                } else {
                    warn!(
                        "expected ({}) and received serial ({}) numbers do not match, resetting",
                        next, value
                    );
                    state.expected = value;
                    state.resyncs += 1;
                    Progress::Resynchronized {
                        expected: next,
                        received: value,
                    }
                }
            }
            Err(error) => {
                state.failures += 1;
                if state.first_failure.is_some() {
                    debug!(
                        "invocation #{} failed after a failure was already latched: {}",
                        outcome.sequence, error
                    );
                    return Progress::Failed { latched: false };
                }
                warn!("invocation #{} failed: {}", outcome.sequence, error);
                state.first_failure = Some(LatchedFailure {
                    sequence: outcome.sequence,
                    error,
                });
                Progress::Failed { latched: true }
            }
        }
    }

    /// Record a successful invocation, numbering it after the ones recorded so far.
    pub fn record_success(&self, value: i64) -> Progress {
        let sequence = self.invocation_count() + 1;
        self.record(InvocationOutcome::success(sequence, value))
    }

    /// Record a failed invocation, numbering it after the ones recorded so far.
    pub fn record_failure(&self, error: InvocationError) -> Progress {
        let sequence = self.invocation_count() + 1;
        self.record(InvocationOutcome::failure(sequence, error))
    }

    /// Fail with the latched failure and `label` if any failure was recorded.
    pub fn assert_no_failure(&self, label: &str) -> HarnessResult<()> {
        let state = self.lock();
        match &state.first_failure {
            None => Ok(()),
            Some(latched) => {
                error!(
                    "client threw an exception {}: invocation #{} failed: {} ({} failures total)",
                    label, latched.sequence, latched.error, state.failures
                );
                Err(HarnessError::CorrectnessViolation {
                    label: label.to_string(),
                    sequence: latched.sequence,
                    failure: latched.error.clone(),
                })
            }
        }
    }

    /// Number of outcomes recorded so far.
    pub fn invocation_count(&self) -> u64 {
        self.lock().invocations
    }

    /// Consistent copy of the whole state.
    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = self.lock();
        MonitorSnapshot {
            expected: state.expected,
            invocations: state.invocations,
            failures: state.failures,
            resyncs: state.resyncs,
            first_failure: state.first_failure.clone(),
        }
    }
}
