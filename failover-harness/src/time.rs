//! Time provider abstraction for the harness.
//!
//! Every wait the orchestrator performs and every delay between driver ticks
//! goes through [`TimeProvider`], so the whole scripted run can be executed
//! against tokio's paused clock in tests and against wall-clock time in a
//! real environment with identical code.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during time operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The operation timed out.
    #[error("operation timed out")]
    Elapsed,

    /// The time provider has been shut down and is no longer accessible.
    #[error("time provider shut down")]
    Shutdown,
}

/// Provider trait for time operations.
///
/// ## Time Semantics
///
/// - `now()`: elapsed time since the provider was created. Used for report
///   timestamps and elapsed-time measurement.
/// - `sleep()`: suspends the caller. Under a paused tokio clock this advances
///   virtual time instead of blocking.
#[async_trait]
pub trait TimeProvider: Clone + Send + Sync + 'static {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration) -> Result<(), TimeError>;

    /// Get the time elapsed since this provider was created.
    fn now(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Ok(result)` if the future completes within the timeout,
    /// or `Err(TimeError::Elapsed)` if it times out.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: Future<Output = T> + Send,
        T: Send;
}

/// Time provider backed by tokio's timer.
///
/// Uses [`tokio::time::Instant`] rather than the std clock so that `now()`
/// follows virtual time when the runtime clock is paused.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) -> Result<(), TimeError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: Future<Output = T> + Send,
        T: Send,
    {
        match tokio::time::timeout(duration, future).await {
            Ok(result) => Ok(result),
            Err(_) => Err(TimeError::Elapsed),
        }
    }
}
