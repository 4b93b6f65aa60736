use crate::context::CoroSync;
use crate::errors::Result;
use crate::future::{SharedState, WaitStatus};
use std::sync::Arc;
use std::time::Duration;

/// Waitable handle to the result of a blocking I/O task.
///
/// Two wait families are offered. The thread-waiting forms (`wait`, `get`,
/// `wait_for`) block the calling OS thread and raise `BadContext` when
/// called from inside a cooperative task. The coroutine-waiting forms
/// (`wait_coro`, `get_coro`, `wait_for_coro`) take the caller's yield
/// handle and suspend the task instead, keeping its worker free.
pub struct Future<T> {
    state: Arc<SharedState<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> Future<T> {
    pub(crate) fn new(state: Arc<SharedState<T>>) -> Self {
        Self { state }
    }

    pub fn is_resolved(&self) -> bool {
        self.state.is_resolved()
    }

    /// Blocks the calling thread until the task has resolved.
    pub fn wait(&self) -> Result<()> {
        self.state.wait()
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<WaitStatus> {
        self.state.wait_for(timeout)
    }

    /// Blocks the calling thread, then clones the value out.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        self.state.wait()?;
        self.state.try_value()
    }

    /// Suspends the calling cooperative task until the result is available.
    pub fn wait_coro(&self, sync: &CoroSync) -> Result<()> {
        self.state.wait_coro(sync)
    }

    pub fn wait_for_coro(&self, sync: &CoroSync, timeout: Duration) -> Result<WaitStatus> {
        self.state.wait_for_coro(sync, timeout)
    }

    pub fn get_coro(&self, sync: &CoroSync) -> Result<T>
    where
        T: Clone,
    {
        self.state.wait_coro(sync)?;
        self.state.try_value()
    }
}
