//! Test orchestrator: the foreground fault-injection timeline.
//!
//! [`FailoverTest`] acquires the service handle, seeds the monitor with a
//! warm-up invocation, starts the [`InvocationDriver`], then walks the
//! [`Script`]: waits, node toggles, checkpoints. Any fatal error aborts the
//! script. On every exit path the driver is cancelled and the handle is
//! released before the error is returned.
//!
//! # Usage
//!
//! ```ignore
//! let cluster = SimCluster::new(ClusterTopology::four_nodes());
//! let mut test = FailoverTest::new(
//!     cluster.factory(),
//!     "ForwardingStatefulSBImpl",
//!     cluster.controller(),
//!     ClusterTopology::four_nodes(),
//!     TimingConfig::from_env()?,
//! );
//! test.initialize()?;
//! let report = test.run().await?;
//! println!("{report}");
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::TimingConfig;
use crate::driver::InvocationDriver;
use crate::error::{HarnessError, HarnessResult};
use crate::monitor::{ConsistencyMonitor, MonitorSnapshot};
use crate::script::{OutageCheckpoints, Script, ScriptStep};
use crate::service::{HandleGuard, ServiceFactory};
use crate::time::{TimeProvider, TokioTimeProvider};
use crate::topology::{ClusterTopology, TopologyController, TrackedTopology};

/// Summary of a run in which every checkpoint passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Implementation identifier the handle was acquired for.
    pub implementation: String,
    /// Value returned by the warm-up invocation.
    pub seed: i64,
    /// Checkpoint labels that passed, in order.
    pub checkpoints: Vec<String>,
    /// Monitor state when the driver was cancelled.
    pub monitor: MonitorSnapshot,
    /// Time from acquisition to driver cancellation.
    pub elapsed: Duration,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Failover Report: {} ===", self.implementation)?;
        writeln!(f, "Invocations: {}", self.monitor.invocations)?;
        writeln!(f, "Resynchronizations: {}", self.monitor.resyncs)?;
        writeln!(f, "Failures: {}", self.monitor.failures)?;
        writeln!(f, "Serial: {} -> {}", self.seed, self.monitor.expected)?;
        writeln!(f, "Elapsed: {:?}", self.elapsed)?;
        writeln!(f)?;
        for label in &self.checkpoints {
            writeln!(f, "✅ {}", label)?;
        }
        Ok(())
    }
}

/// Scripted failover test against one service implementation.
pub struct FailoverTest<C, T> {
    factory: Arc<dyn ServiceFactory>,
    implementation: String,
    topology: TrackedTopology<C, T>,
    timing: TimingConfig,
    outage_checkpoints: OutageCheckpoints,
    time: T,
    script: Option<Script>,
}

impl<C: TopologyController> FailoverTest<C, TokioTimeProvider> {
    /// Create a test running on tokio's clock.
    pub fn new(
        factory: Arc<dyn ServiceFactory>,
        implementation: impl Into<String>,
        controller: C,
        topology: ClusterTopology,
        timing: TimingConfig,
    ) -> Self {
        Self::with_time(
            factory,
            implementation,
            controller,
            topology,
            timing,
            TokioTimeProvider::new(),
        )
    }
}

impl<C, T> FailoverTest<C, T>
where
    C: TopologyController,
    T: TimeProvider,
{
    /// Create a test using the given time provider.
    pub fn with_time(
        factory: Arc<dyn ServiceFactory>,
        implementation: impl Into<String>,
        controller: C,
        topology: ClusterTopology,
        timing: TimingConfig,
        time: T,
    ) -> Self {
        Self {
            factory,
            implementation: implementation.into(),
            topology: TrackedTopology::new(controller, topology, time.clone()),
            timing,
            outage_checkpoints: OutageCheckpoints::default(),
            time,
            script: None,
        }
    }

    /// Choose when to assert while a node is down.
    pub fn with_outage_checkpoints(mut self, policy: OutageCheckpoints) -> Self {
        self.outage_checkpoints = policy;
        self.script = None;
        self
    }

    /// The tracked topology.
    pub fn topology(&self) -> &TrackedTopology<C, T> {
        &self.topology
    }

    /// One-time setup before the scripted phase.
    ///
    /// Validates the timing configuration, generates the toggle script, and
    /// checks it never takes a whole sub-cluster down. Called by
    /// [`run`](Self::run) if not called explicitly.
    pub fn initialize(&mut self) -> HarnessResult<&Script> {
        self.timing.validate()?;
        let script = Script::generate(
            self.topology.topology(),
            &self.timing,
            self.outage_checkpoints,
        );
        script.validate(self.topology.topology())?;

        info!(
            implementation = %self.implementation,
            nodes = self.topology.topology().len(),
            checkpoints = script.checkpoints().count(),
            scripted = ?script.total_wait(),
            "failover test initialized"
        );
        Ok(self.script.insert(script))
    }

    /// Execute the full run.
    pub async fn run(&mut self) -> HarnessResult<RunReport> {
        let script = match self.script.clone() {
            Some(script) => script,
            None => self.initialize()?.clone(),
        };
        let started = self.time.now();

        let handle = HandleGuard::new(self.factory.acquire(&self.implementation).await?);

        info!("waiting for clusters to form");
        self.time.sleep(self.timing.convergence_window).await?;

        let seed = handle
            .handle()
            .fetch_and_increment()
            .await
            .map_err(HarnessError::WarmUp)?;
        debug!("first invocation: serial = {}", seed);

        let monitor = Arc::new(ConsistencyMonitor::new(seed));
        let mut driver = InvocationDriver::new(
            handle.handle().clone(),
            monitor.clone(),
            self.time.clone(),
            self.timing.invocation_period,
        )
        .with_invocation_timeout(self.timing.invocation_timeout);
        driver.start()?;

        let mut checkpoints = Vec::new();
        let outcome = self.execute(&script, &monitor, &mut checkpoints).await;

        driver.cancel();
        handle.release();

        let snapshot = monitor.snapshot();
        match outcome {
            Ok(()) => {
                info!(
                    invocations = snapshot.invocations,
                    resyncs = snapshot.resyncs,
                    "failover test passed"
                );
                Ok(RunReport {
                    implementation: self.implementation.clone(),
                    seed,
                    checkpoints,
                    monitor: snapshot,
                    elapsed: self.time.now().saturating_sub(started),
                })
            }
            Err(err) => {
                error!(
                    invocations = snapshot.invocations,
                    passed = checkpoints.len(),
                    "failover test aborted: {}",
                    err
                );
                Err(err)
            }
        }
    }

    async fn execute(
        &mut self,
        script: &Script,
        monitor: &ConsistencyMonitor,
        checkpoints: &mut Vec<String>,
    ) -> HarnessResult<()> {
        for step in script.steps() {
            match step {
                ScriptStep::Wait { kind, duration } => {
                    debug!("{} window: {:?}", kind, duration);
                    self.time.sleep(*duration).await?;
                }
                ScriptStep::Stop(node) => {
                    self.topology.stop(node, self.timing.grace_period).await?;
                }
                ScriptStep::Start(node) => {
                    self.topology.start(node).await?;
                }
                ScriptStep::Checkpoint(label) => {
                    monitor.assert_no_failure(label)?;
                    debug!(invocations = monitor.invocation_count(), "checkpoint passed {}", label);
                    checkpoints.push(label.clone());
                }
            }
        }
        Ok(())
    }
}
