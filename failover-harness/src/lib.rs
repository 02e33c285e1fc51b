//! # failover-harness
//!
//! Continuous-invocation consistency harness for clustered stateful services.
//!
//! A background driver invokes a fetch-and-increment operation at a fixed
//! delay while a scripted orchestrator stops and restarts cluster members one
//! at a time. At every checkpoint the harness asserts that no invocation has
//! failed and reports the first failure, with the checkpoint label, if one has.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ FailoverTest (orchestrator)                                  │
//! │   Script: waits, stop/start, checkpoints                     │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │ InvocationDriver (spawned)   │ TrackedTopology               │
//! │   fixed-delay ticks          │   grace period, isolation     │
//! │   CancellationToken          │   guard over the controller   │
//! ├──────────────────────────────┼───────────────────────────────┤
//! │ ConsistencyMonitor           │ TopologyController (external) │
//! │   expected serial, latch     │                               │
//! ├──────────────────────────────┴───────────────────────────────┤
//! │ ServiceHandle / ServiceFactory (external), TimeProvider      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure classes
//!
//! | Class | Type | Fatal |
//! |-------|------|-------|
//! | Transient invocation failure | [`InvocationError`] | no, latched |
//! | Correctness violation | [`HarnessError::CorrectnessViolation`] | yes |
//! | Node control failure | [`HarnessError::Topology`] | yes |
//! | Acquisition failure | [`HarnessError::Acquisition`] | yes, before any phase |
//!
//! [`sim`] provides an in-process cluster for exercising the harness.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod script;
pub mod service;
pub mod sim;
pub mod time;
pub mod topology;

pub use config::TimingConfig;
pub use driver::{DriverState, InvocationDriver};
pub use error::{HarnessError, HarnessResult, InvocationError, ServiceError, TopologyError};
pub use monitor::{ConsistencyMonitor, InvocationOutcome, LatchedFailure, MonitorSnapshot, Progress};
pub use orchestrator::{FailoverTest, RunReport};
pub use script::{OutageCheckpoints, Script, ScriptStep, WindowKind};
pub use service::{factory_fn, HandleGuard, ServiceFactory, ServiceHandle};
pub use sim::{SimCluster, SimController};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
pub use topology::{ClusterTopology, NodeId, NodeState, SubCluster, TopologyController, TrackedTopology};
