use crate::context::CoroSync;
use crate::errors::{DispatcherError, Result};
use crate::future::{Future, SharedState, WaitStatus};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Type-erased view of a stage promise, as stored on a continuation chain.
///
/// The hot path (task bodies resolving their own stage) goes through the
/// typed [`Promise`]; this trait only backs inspection, waiting and
/// termination across heterogeneous stages.
pub(crate) trait PromiseBase: Send + Sync {
    /// Best-effort failure; a no-op if already resolved.
    fn fail(&self, err: DispatcherError);

    fn is_resolved(&self) -> bool;

    fn wait(&self) -> Result<()>;

    fn wait_for(&self, timeout: Duration) -> Result<WaitStatus>;

    fn wait_coro(&self, sync: &CoroSync) -> Result<()>;

    fn wait_for_coro(&self, sync: &CoroSync, timeout: Duration) -> Result<WaitStatus>;

    /// Downcast hook for typed access through `get_at`-style readers.
    fn as_any(&self) -> &dyn Any;
}

/// Producer half of a stage promise.
pub(crate) struct Promise<T> {
    state: Arc<SharedState<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(SharedState::new()),
        }
    }

    pub(crate) fn new_buffer(capacity: usize) -> Self {
        Self {
            state: Arc::new(SharedState::new_buffer(capacity)),
        }
    }

    pub(crate) fn set(&self, value: T) -> Result<()> {
        self.state.set(value)
    }

    pub(crate) fn set_exception(&self, err: DispatcherError) -> Result<()> {
        self.state.set_exception(err)
    }

    /// Consumer half sharing this promise's state.
    pub(crate) fn future(&self) -> Future<T> {
        Future::new(self.state.clone())
    }

    pub(crate) fn state(&self) -> &Arc<SharedState<T>> {
        &self.state
    }
}

impl<T: Send + 'static> PromiseBase for Promise<T> {
    fn fail(&self, err: DispatcherError) {
        self.state.fail(err);
    }

    fn is_resolved(&self) -> bool {
        self.state.is_resolved()
    }

    fn wait(&self) -> Result<()> {
        self.state.wait()
    }

    fn wait_for(&self, timeout: Duration) -> Result<WaitStatus> {
        self.state.wait_for(timeout)
    }

    fn wait_coro(&self, sync: &CoroSync) -> Result<()> {
        self.state.wait_coro(sync)
    }

    fn wait_for_coro(&self, sync: &CoroSync, timeout: Duration) -> Result<WaitStatus> {
        self.state.wait_for_coro(sync, timeout)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
