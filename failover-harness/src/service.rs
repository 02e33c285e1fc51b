//! Service handle abstraction.
//!
//! The service under test is opaque: the harness only needs a way to acquire
//! a handle for a given implementation, one fetch-and-increment operation on
//! it, and a release hook. [`HandleGuard`] guarantees the release happens
//! exactly once, including when a run aborts early.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{InvocationError, ServiceError};

/// Handle to one logical, possibly multi-instance, remote stateful service.
#[async_trait]
pub trait ServiceHandle: Send + Sync {
    /// Fetch the server-side counter and increment it.
    ///
    /// Returns the value before the increment.
    async fn fetch_and_increment(&self) -> Result<i64, InvocationError>;

    /// Release the underlying transport.
    ///
    /// Called exactly once by [`HandleGuard`]. Default implementation is a no-op.
    fn release(&self) {}
}

/// Source of service handles, keyed by implementation identifier.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    /// Acquire a handle to the named implementation.
    async fn acquire(&self, implementation: &str) -> Result<Arc<dyn ServiceHandle>, ServiceError>;
}

struct FnFactory<F> {
    acquire_fn: F,
}

#[async_trait]
impl<F, Fut> ServiceFactory for FnFactory<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Arc<dyn ServiceHandle>, ServiceError>> + Send + 'static,
{
    async fn acquire(&self, implementation: &str) -> Result<Arc<dyn ServiceHandle>, ServiceError> {
        (self.acquire_fn)(implementation.to_string()).await
    }
}

/// Create a service factory from an async closure.
///
/// The closure receives the implementation identifier.
///
/// # Example
///
/// ```ignore
/// let factory = factory_fn(|implementation| async move {
///     let handle = connect(&implementation).await?;
///     Ok(Arc::new(handle) as Arc<dyn ServiceHandle>)
/// });
/// ```
pub fn factory_fn<F, Fut>(acquire_fn: F) -> Arc<dyn ServiceFactory>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn ServiceHandle>, ServiceError>> + Send + 'static,
{
    Arc::new(FnFactory { acquire_fn })
}

/// Owns an acquired handle and releases it exactly once.
///
/// Release happens on [`release`](Self::release) or on drop, whichever comes
/// first.
pub struct HandleGuard {
    handle: Arc<dyn ServiceHandle>,
    released: bool,
}

impl HandleGuard {
    /// Take ownership of an acquired handle.
    pub fn new(handle: Arc<dyn ServiceHandle>) -> Self {
        Self {
            handle,
            released: false,
        }
    }

    /// The guarded handle.
    pub fn handle(&self) -> &Arc<dyn ServiceHandle> {
        &self.handle
    }

    /// Release the handle now.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            debug!("releasing service handle");
            self.handle.release();
        }
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}
