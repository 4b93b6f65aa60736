use crate::context::{ChainState, current};
use crate::errors::{DispatcherError, Result};
use crate::future::{Future, WaitStatus};
use crate::queue::QueueId;
use crate::task::{SuspendReason, TaskResult};
use corosensei::Yielder;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::ThreadContext;

/// Yield handle of a running cooperative task.
///
/// This is the only way a task can return control to its worker. Library
/// primitives take it to implement coroutine-waiting forms; it validates on
/// every use that the caller really is the task it was issued to, so a
/// handle smuggled into another task (or onto a plain thread) fails with
/// `BadContext` instead of corrupting the scheduler.
pub struct CoroSync {
    yielder: NonNull<Yielder<(), SuspendReason>>,
    token: (usize, usize),
}

impl CoroSync {
    fn new(yielder: &Yielder<(), SuspendReason>, token: (usize, usize)) -> Self {
        Self {
            yielder: NonNull::from(yielder),
            token,
        }
    }

    /// Confirms the calling code is running inside the task this handle
    /// belongs to.
    pub(crate) fn validate(&self) -> Result<()> {
        match current::active_token() == Some(self.token) {
            true => Ok(()),
            false => Err(DispatcherError::BadContext),
        }
    }

    /// Suspends the running coroutine. Callers must have validated the
    /// handle on entry to the current operation.
    pub(crate) fn suspend(&self, reason: SuspendReason) {
        debug_assert!(self.validate().is_ok());
        // Safety: validation pinned this handle to the coroutine currently
        // executing on this thread, so the yielder reference is live for
        // the duration of the call.
        unsafe { self.yielder.as_ref() }.suspend(reason);
    }
}

/// Per-stage façade handed to a cooperative task body.
///
/// All waiting forms on this type suspend the task cooperatively instead of
/// blocking the worker thread. Earlier stages of the chain are addressed by
/// index; negative indices count back from this stage (-1 is the previous
/// stage).
pub struct CoroContext<T> {
    chain: Arc<ChainState>,
    stage: usize,
    sync: CoroSync,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Send + 'static> CoroContext<T> {
    /// The task's yield handle, for waiting on foreign futures or contexts
    /// from inside this task.
    pub fn sync(&self) -> &CoroSync {
        &self.sync
    }

    /// Resolves this stage's promise early, before the body returns. The
    /// body's eventual return value is then discarded.
    pub fn set(&self, value: T) -> Result<()> {
        self.chain.typed_promise::<T>(self.stage)?.set(value)
    }

    /// Hands control back to the worker; the task is re-enqueued at the
    /// tail of its queue at normal priority.
    pub fn yield_now(&self) -> Result<()> {
        self.sync.validate()?;
        self.sync.suspend(SuspendReason::Yielded);
        Ok(())
    }

    /// Cooperative sleep: yields until the deadline has passed. The worker
    /// keeps serving other tasks meanwhile.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.sync.validate()?;
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.sync.suspend(SuspendReason::Yielded);
        }
        Ok(())
    }

    fn read_index(&self, num: i32) -> Result<usize> {
        let index = self.chain.index(self.stage, num)?;
        if index >= self.stage {
            return Err(DispatcherError::InvalidArgument(
                "only earlier stages are readable from a task body",
            ));
        }
        Ok(index)
    }

    /// Waits for stage `num` and clones its value out.
    pub fn get_at<U: Clone + Send + 'static>(&self, num: i32) -> Result<U> {
        let state = self.chain.typed_state::<U>(self.read_index(num)?)?;
        state.wait_coro(&self.sync)?;
        state.try_value()
    }

    /// Borrowed access to stage `num`'s value, without cloning.
    pub fn get_ref_at<U: Send + 'static, R>(&self, num: i32, f: impl FnOnce(&U) -> R) -> Result<R> {
        let state = self.chain.typed_state::<U>(self.read_index(num)?)?;
        state.wait_coro(&self.sync)?;
        state.with_value(f)
    }

    /// Value of the previous stage; the canonical read inside a
    /// continuation.
    pub fn get_prev<U: Clone + Send + 'static>(&self) -> Result<U> {
        self.get_at(-1)
    }

    pub fn wait_at(&self, num: i32) -> Result<()> {
        self.chain
            .promise_at(self.read_index(num)?)?
            .wait_coro(&self.sync)
    }

    pub fn wait_for_at(&self, num: i32, timeout: Duration) -> Result<WaitStatus> {
        self.chain
            .promise_at(self.read_index(num)?)?
            .wait_for_coro(&self.sync, timeout)
    }

    /// Waits for every earlier stage of the chain, ignoring their outcomes.
    pub fn wait_all(&self) -> Result<()> {
        for index in 0..self.stage {
            self.chain.promise_at(index)?.wait_coro(&self.sync)?;
        }
        Ok(())
    }

    // --- Buffer mode ---

    /// Appends a value to this stage's buffer, cooperatively waiting while
    /// it is full.
    pub fn push(&self, value: T) -> Result<()> {
        self.chain
            .typed_state::<T>(self.stage)?
            .push_coro(&self.sync, value)
    }

    /// Marks this stage's buffer as end-of-stream. Also performed
    /// implicitly when a buffered stage body returns successfully.
    pub fn close_buffer(&self) -> Result<()> {
        self.chain.typed_state::<T>(self.stage)?.close_buffer()
    }

    /// Pops the next value from stage `num`'s buffer, cooperatively waiting
    /// while it is empty. `None` once the buffer is closed and drained.
    pub fn pull_at<U: Send + 'static>(&self, num: i32) -> Result<Option<U>> {
        self.chain
            .typed_state::<U>(self.read_index(num)?)?
            .pull_coro(&self.sync)
    }

    pub fn pull_prev<U: Send + 'static>(&self) -> Result<Option<U>> {
        self.pull_at(-1)
    }

    // --- Nested submissions ---

    /// Posts a new standalone chain; unlike outside posts this stays
    /// allowed while the dispatcher drains.
    pub fn post<U, F>(&self, f: F) -> Result<ThreadContext<U>>
    where
        U: Send + 'static,
        F: FnOnce(&CoroContext<U>) -> anyhow::Result<U> + Send + 'static,
    {
        self.post_on(QueueId::Any, false, f)
    }

    pub fn post_on<U, F>(
        &self,
        queue_id: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<ThreadContext<U>>
    where
        U: Send + 'static,
        F: FnOnce(&CoroContext<U>) -> anyhow::Result<U> + Send + 'static,
    {
        self.chain
            .core()?
            .create_chain(queue_id, high_priority, true, f)
    }

    /// Opens a new continuation chain; submission happens at `end()`.
    pub fn post_first<U, F>(&self, f: F) -> Result<ThreadContext<U>>
    where
        U: Send + 'static,
        F: FnOnce(&CoroContext<U>) -> anyhow::Result<U> + Send + 'static,
    {
        self.post_first_on(QueueId::Any, false, f)
    }

    pub fn post_first_on<U, F>(
        &self,
        queue_id: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<ThreadContext<U>>
    where
        U: Send + 'static,
        F: FnOnce(&CoroContext<U>) -> anyhow::Result<U> + Send + 'static,
    {
        self.chain
            .core()?
            .create_chain(queue_id, high_priority, false, f)
    }

    /// Submits a blocking job to the I/O pool; await the returned future
    /// with its coroutine-waiting forms and this task's `sync()`.
    pub fn post_async_io<U, F>(&self, f: F) -> Result<Future<U>>
    where
        U: Send + 'static,
        F: FnOnce() -> anyhow::Result<U> + Send + 'static,
    {
        self.post_async_io_on(QueueId::Any, false, f)
    }

    pub fn post_async_io_on<U, F>(
        &self,
        queue_id: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<Future<U>>
    where
        U: Send + 'static,
        F: FnOnce() -> anyhow::Result<U> + Send + 'static,
    {
        self.chain
            .core()?
            .create_io_future(queue_id, high_priority, f)
    }

    pub fn num_coroutine_threads(&self) -> Result<usize> {
        Ok(self.chain.core()?.num_coroutine_threads())
    }

    pub fn num_io_threads(&self) -> Result<usize> {
        Ok(self.chain.core()?.num_io_threads())
    }
}

fn make_context<T>(
    chain: &Arc<ChainState>,
    stage: usize,
    yielder: &Yielder<(), SuspendReason>,
) -> CoroContext<T> {
    let token = (Arc::as_ptr(chain) as usize, stage);
    CoroContext {
        chain: chain.clone(),
        stage,
        sync: CoroSync::new(yielder, token),
        _marker: PhantomData,
    }
}

/// Wraps a value-stage body into a coroutine entry point: builds the
/// stage's `CoroContext`, catches panics, and resolves the stage promise
/// from the body's outcome. The returned error (if any) steers the worker's
/// chain walker; the stage promise has already been resolved either way.
pub(crate) fn bind_value_stage<T, F>(
    chain: Arc<ChainState>,
    stage: usize,
    f: F,
) -> impl FnOnce(&Yielder<(), SuspendReason>, ()) -> TaskResult + Send + 'static
where
    T: Send + 'static,
    F: FnOnce(&CoroContext<T>) -> anyhow::Result<T> + Send + 'static,
{
    move |yielder, ()| {
        let ctx = make_context::<T>(&chain, stage, yielder);
        let outcome = catch_unwind(AssertUnwindSafe(|| f(&ctx)));
        let promise = chain
            .typed_promise::<T>(stage)
            .expect("stage promise disappeared");
        match outcome {
            Ok(Ok(value)) => {
                if chain.is_terminated() {
                    return Err(DispatcherError::Terminated);
                }
                // The body may have resolved its own promise via `set`; the
                // late return value is then discarded.
                match promise.set(value) {
                    Ok(()) | Err(DispatcherError::PromiseAlreadySet) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Ok(Err(err)) => {
                let err = DispatcherError::user(err);
                let _ = promise.set_exception(err.clone());
                Err(err)
            }
            Err(panic) => {
                let err = crate::utils::panic_to_error(panic);
                let _ = promise.set_exception(err.clone());
                Err(err)
            }
        }
    }
}

/// Buffered-stage counterpart: the body streams values through `push` and
/// returns `()`; a successful return closes the buffer, an error fails it.
pub(crate) fn bind_buffered_stage<T, F>(
    chain: Arc<ChainState>,
    stage: usize,
    f: F,
) -> impl FnOnce(&Yielder<(), SuspendReason>, ()) -> TaskResult + Send + 'static
where
    T: Send + 'static,
    F: FnOnce(&CoroContext<T>) -> anyhow::Result<()> + Send + 'static,
{
    move |yielder, ()| {
        let ctx = make_context::<T>(&chain, stage, yielder);
        let outcome = catch_unwind(AssertUnwindSafe(|| f(&ctx)));
        let state = chain
            .typed_state::<T>(stage)
            .expect("stage promise disappeared");
        match outcome {
            Ok(Ok(())) => {
                if chain.is_terminated() {
                    return Err(DispatcherError::Terminated);
                }
                let _ = state.close_buffer();
                Ok(())
            }
            Ok(Err(err)) => {
                let err = DispatcherError::user(err);
                state.fail(err.clone());
                Err(err)
            }
            Err(panic) => {
                let err = crate::utils::panic_to_error(panic);
                state.fail(err.clone());
                Err(err)
            }
        }
    }
}
