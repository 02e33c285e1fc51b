//! Invocation driver: the background request loop.
//!
//! One spawned task invokes the service, records the outcome, sleeps for the
//! configured period, and repeats. The delay is measured from the end of one
//! invocation to the start of the next, so a slow call during failover
//! stretches the schedule instead of overlapping with the next tick.
//!
//! ```text
//!   Idle ──start()──> Running ──cancel()──> Cancelled
//!     └──────────────cancel()──────────────────┘
//! ```
//!
//! Cancellation goes through a [`CancellationToken`]. It is checked before
//! every tick and raced against both the in-flight call and the inter-tick
//! sleep, so `cancel()` never waits for a slow invocation and no tick starts
//! after it returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{HarnessError, HarnessResult, InvocationError};
use crate::monitor::{ConsistencyMonitor, InvocationOutcome};
use crate::service::ServiceHandle;
use crate::time::TimeProvider;

/// Lifecycle of an [`InvocationDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Created, not yet scheduled.
    Idle,
    /// The periodic task is scheduled.
    Running,
    /// Terminal; no further invocation will start.
    Cancelled,
}

/// Periodic, fixed-delay invoker feeding a [`ConsistencyMonitor`].
pub struct InvocationDriver<T: TimeProvider> {
    service: Arc<dyn ServiceHandle>,
    monitor: Arc<ConsistencyMonitor>,
    time: T,
    period: Duration,
    invocation_timeout: Option<Duration>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T: TimeProvider> InvocationDriver<T> {
    /// Create an idle driver.
    pub fn new(
        service: Arc<dyn ServiceHandle>,
        monitor: Arc<ConsistencyMonitor>,
        time: T,
        period: Duration,
    ) -> Self {
        Self {
            service,
            monitor,
            time,
            period,
            invocation_timeout: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Record calls that take longer than `timeout` as failures.
    pub fn with_invocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DriverState {
        if self.cancel.is_cancelled() {
            DriverState::Cancelled
        } else if self.task.is_some() {
            DriverState::Running
        } else {
            DriverState::Idle
        }
    }

    /// The monitor this driver reports to.
    pub fn monitor(&self) -> &Arc<ConsistencyMonitor> {
        &self.monitor
    }

    /// Schedule the periodic task. The first invocation starts immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> HarnessResult<()> {
        match self.state() {
            DriverState::Idle => {}
            DriverState::Running => {
                return Err(HarnessError::InvalidState("driver already running".into()));
            }
            DriverState::Cancelled => {
                return Err(HarnessError::InvalidState(
                    "driver was cancelled and cannot be restarted".into(),
                ));
            }
        }

        info!(period = ?self.period, "starting invocation driver");
        let tick = Tick {
            service: self.service.clone(),
            monitor: self.monitor.clone(),
            time: self.time.clone(),
            period: self.period,
            invocation_timeout: self.invocation_timeout,
            cancel: self.cancel.clone(),
        };
        self.task = Some(tokio::spawn(tick.run()));
        Ok(())
    }

    /// Stop scheduling invocations. Idempotent and non-blocking.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!(
                invocations = self.monitor.invocation_count(),
                "cancelling invocation driver"
            );
            self.cancel.cancel();
        }
    }

    /// Cancel and wait for the task to exit.
    pub async fn join(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            // The loop never panics on its own; a JoinError here means the
            // runtime is shutting down.
            let _ = task.await;
        }
    }
}

impl<T: TimeProvider> Drop for InvocationDriver<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State moved into the spawned task.
struct Tick<T> {
    service: Arc<dyn ServiceHandle>,
    monitor: Arc<ConsistencyMonitor>,
    time: T,
    period: Duration,
    invocation_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<T: TimeProvider> Tick<T> {
    async fn run(self) {
        let mut sequence: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            sequence += 1;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.invoke() => result,
            };

            match &result {
                Ok(value) => debug!("client invocation #{} received serial #{}", sequence, value),
                Err(err) => debug!("client invocation #{} failed: {}", sequence, err),
            }
            self.monitor.record(InvocationOutcome { sequence, result });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                slept = self.time.sleep(self.period) => {
                    if slept.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(ticks = sequence, "invocation driver stopped");
    }

    async fn invoke(&self) -> Result<i64, InvocationError> {
        match self.invocation_timeout {
            None => self.service.fetch_and_increment().await,
            Some(limit) => self
                .time
                .timeout(limit, self.service.fetch_and_increment())
                .await
                .unwrap_or(Err(InvocationError::Timeout(limit))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::time::TokioTimeProvider;

    /// Counter service with configurable latency and a failure schedule.
    #[derive(Default)]
    struct ScriptedService {
        counter: AtomicI64,
        calls: AtomicU32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
        latency: Duration,
        fail_every: u32,
    }

    #[async_trait]
    impl ServiceHandle for ScriptedService {
        async fn fetch_and_increment(&self) -> Result<i64, InvocationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_every > 0 && call % self.fail_every == 0 {
                return Err(InvocationError::Remote(format!("call {call} rejected")));
            }
            Ok(self.counter.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn driver(service: Arc<ScriptedService>, period: Duration) -> InvocationDriver<TokioTimeProvider> {
        InvocationDriver::new(
            service,
            Arc::new(ConsistencyMonitor::new(-1)),
            TokioTimeProvider::new(),
            period,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_ticks() {
        let service = Arc::new(ScriptedService::default());
        let mut driver = driver(service.clone(), Duration::from_millis(10));
        driver.start().expect("start");

        tokio::time::sleep(Duration::from_millis(200)).await;
        driver.cancel();
        let at_cancel = driver.monitor().invocation_count();
        assert!((19..=21).contains(&at_cancel), "got {at_cancel} ticks");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(driver.monitor().invocation_count(), at_cancel);
        assert_eq!(driver.state(), DriverState::Cancelled);
        driver.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stability_window_invocation_count() {
        let service = Arc::new(ScriptedService::default());
        let mut driver = driver(service, Duration::from_millis(100));
        driver.start().expect("start");

        tokio::time::sleep(Duration::from_millis(5000)).await;
        let snap = driver.monitor().snapshot();
        assert!(
            (49..=51).contains(&snap.invocations),
            "got {} invocations",
            snap.invocations
        );
        assert_eq!(snap.failures, 0);
        assert_eq!(snap.resyncs, 0);
        driver.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_loop() {
        let service = Arc::new(ScriptedService {
            fail_every: 3,
            ..Default::default()
        });
        let mut driver = driver(service, Duration::from_millis(10));
        driver.start().expect("start");

        tokio::time::sleep(Duration::from_millis(300)).await;
        let snap = driver.monitor().snapshot();
        assert!(snap.invocations >= 28, "got {}", snap.invocations);
        assert_eq!(snap.failures, snap.invocations / 3);
        assert_eq!(
            snap.first_failure.map(|f| f.sequence),
            Some(3),
            "third call is the first failure"
        );
        driver.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_never_overlaps_slow_calls() {
        let service = Arc::new(ScriptedService {
            latency: Duration::from_millis(150),
            ..Default::default()
        });
        let mut driver = driver(service.clone(), Duration::from_millis(50));
        driver.start().expect("start");

        // Each cycle takes 150ms call + 50ms delay.
        tokio::time::sleep(Duration::from_millis(2000)).await;
        let count = driver.monitor().invocation_count();
        assert!((9..=11).contains(&count), "got {count}");
        assert_eq!(service.max_in_flight.load(Ordering::SeqCst), 1);
        driver.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_invocation_records_nothing_more() {
        let service = Arc::new(ScriptedService {
            latency: Duration::from_secs(60),
            ..Default::default()
        });
        let mut driver = driver(service.clone(), Duration::from_millis(10));
        driver.start().expect("start");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        driver.cancel();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(driver.monitor().invocation_count(), 0);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        driver.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invocation_timeout_is_recorded_as_failure() {
        let service = Arc::new(ScriptedService {
            latency: Duration::from_millis(500),
            ..Default::default()
        });
        let mut driver = driver(service, Duration::from_millis(10))
            .with_invocation_timeout(Some(Duration::from_millis(100)));
        driver.start().expect("start");

        tokio::time::sleep(Duration::from_millis(150)).await;
        let err = driver
            .monitor()
            .assert_no_failure("slow service")
            .expect_err("timeout must latch");
        assert!(matches!(
            err,
            HarnessError::CorrectnessViolation {
                failure: InvocationError::Timeout(_),
                ..
            }
        ));
        driver.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_transitions() {
        let service = Arc::new(ScriptedService::default());
        let mut driver = driver(service.clone(), Duration::from_millis(10));
        assert_eq!(driver.state(), DriverState::Idle);

        driver.start().expect("start");
        assert_eq!(driver.state(), DriverState::Running);
        assert!(driver.start().is_err());

        driver.cancel();
        driver.cancel();
        assert_eq!(driver.state(), DriverState::Cancelled);
        assert!(driver.start().is_err());
        driver.join().await;

        let mut idle = self::driver(service, Duration::from_millis(10));
        idle.cancel();
        assert_eq!(idle.state(), DriverState::Cancelled);
        assert!(idle.start().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_task() {
        let service = Arc::new(ScriptedService::default());
        let mut driver = driver(service.clone(), Duration::from_millis(10));
        driver.start().expect("start");
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(driver);

        let calls = service.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), calls);
    }
}
