//! Units of work submitted to a tier.
//!
//! A [`Task`] either runs a real downstream [`Operation`] or is a
//! fault-injection task that fails deterministically. The fault path is a
//! variant of its own, so operations never see a test flag.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;

/// Boxed error returned by downstream operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An opaque asynchronous downstream call.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Success payload.
    type Output: Send;

    /// Runs the call once.
    async fn execute(&self) -> Result<Self::Output, BoxError>;
}

/// [`Operation`] backed by a closure returning a future.
pub struct FnOperation<F> {
    f: F,
}

/// Wraps a closure as an [`Operation`].
///
/// ```rust
/// use bulkhead::{operation, BoxError, Task};
///
/// let task = Task::execute(operation(|| async { Ok::<_, BoxError>(vec!["row"]) }));
/// assert!(!task.is_fault_injected());
/// ```
pub fn operation<F, Fut, T>(f: F) -> FnOperation<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    T: Send + 'static,
{
    FnOperation { f }
}

#[async_trait]
impl<F, Fut, T> Operation for FnOperation<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    async fn execute(&self) -> Result<T, BoxError> {
        (self.f)().await
    }
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation").finish_non_exhaustive()
    }
}

/// A unit of work bound for one tier.
#[derive(Debug)]
pub enum Task<O> {
    /// Run the downstream operation.
    Execute(O),
    /// Fail deterministically after acquiring the tier's pools.
    InjectFault,
}

impl<O: Operation> Task<O> {
    /// A task running `operation`.
    pub fn execute(operation: O) -> Self {
        Self::Execute(operation)
    }

    /// A task that always fails.
    pub fn inject_fault() -> Self {
        Self::InjectFault
    }

    /// Whether this is a fault-injection task.
    pub fn is_fault_injected(&self) -> bool {
        matches!(self, Self::InjectFault)
    }
}
