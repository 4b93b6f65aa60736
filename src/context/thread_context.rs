use crate::context::{ChainState, CoroContext, CoroSync, bind_value_stage};
use crate::errors::{DispatcherError, Result};
use crate::future::{Promise, WaitStatus};
use crate::queue::QueueId;
use crate::task::{Task, TaskType};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Handle to one stage of a continuation chain, as seen from outside the
/// cooperative pool.
///
/// Chains are built by consuming the handle: `post_first(...)?.then(...)?
/// .on_error(...)?.finally(...)?.end()?`. Nothing runs until `end()`
/// submits the head. The handle returned by `end()` addresses the last
/// stage, so `get()` on it yields the chain's final value.
///
/// Waiting forms on this type block the calling OS thread and fail with
/// `BadContext` when invoked from inside a cooperative task; use the
/// `_coro` forms with a task's yield handle there instead.
pub struct ThreadContext<T> {
    chain: Arc<ChainState>,
    stage: usize,
    /// This stage's task; shared ownership with the queues once submitted.
    task: Arc<Task>,
    /// The unsubmitted chain head, carried along while building; moved into
    /// the dispatcher by `end()`.
    head: Option<Arc<Task>>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Send + 'static> ThreadContext<T> {
    pub(crate) fn new(
        chain: Arc<ChainState>,
        stage: usize,
        task: Arc<Task>,
        head: Option<Arc<Task>>,
    ) -> Self {
        Self {
            chain,
            stage,
            task,
            head,
            _marker: PhantomData,
        }
    }

    // --- Chain building ---

    /// Appends a continuation stage, run when this stage succeeds.
    pub fn then<U, F>(self, f: F) -> Result<ThreadContext<U>>
    where
        U: Send + 'static,
        F: FnOnce(&CoroContext<U>) -> anyhow::Result<U> + Send + 'static,
    {
        self.append(TaskType::Continuation, f)
    }

    /// Appends an error handler, run only when an earlier stage failed. It
    /// may recover: its own success resumes the chain's success path.
    pub fn on_error<U, F>(self, f: F) -> Result<ThreadContext<U>>
    where
        U: Send + 'static,
        F: FnOnce(&CoroContext<U>) -> anyhow::Result<U> + Send + 'static,
    {
        self.append(TaskType::ErrorHandler, f)
    }

    /// Appends the chain's single finalizer; it always runs, on both the
    /// success and the error path.
    pub fn finally<U, F>(self, f: F) -> Result<ThreadContext<U>>
    where
        U: Send + 'static,
        F: FnOnce(&CoroContext<U>) -> anyhow::Result<U> + Send + 'static,
    {
        self.append(TaskType::Final, f)
    }

    fn append<U, F>(mut self, task_type: TaskType, f: F) -> Result<ThreadContext<U>>
    where
        U: Send + 'static,
        F: FnOnce(&CoroContext<U>) -> anyhow::Result<U> + Send + 'static,
    {
        if self.chain.is_terminated() {
            return Err(DispatcherError::Terminated);
        }
        if self.chain.is_sealed() {
            return Err(DispatcherError::ChainClosed);
        }
        match task_type {
            TaskType::Final => self.chain.try_set_final()?,
            // Nothing may follow the finalizer.
            _ if self.chain.has_final() => return Err(DispatcherError::ChainClosed),
            _ => {}
        }

        let core = self.chain.core()?;
        let stage = self.chain.push_promise(Arc::new(Promise::<U>::new()));
        let body = bind_value_stage::<U, F>(self.chain.clone(), stage, f);
        let task = Task::new(
            &self.chain,
            stage,
            task_type,
            QueueId::Any,
            false,
            core.coro_stack_size(),
            body,
        )?;
        self.task.set_next(task.clone());
        task.set_prev(&self.task);

        Ok(ThreadContext::new(
            self.chain.clone(),
            stage,
            task,
            self.head.take(),
        ))
    }

    /// Seals the chain and submits its head for execution.
    pub fn end(mut self) -> Result<ThreadContext<T>> {
        if self.chain.is_terminated() {
            return Err(DispatcherError::Terminated);
        }
        if self.chain.is_sealed() {
            return Err(DispatcherError::ChainClosed);
        }
        let Some(head) = self.head.take() else {
            return Err(DispatcherError::ChainClosed);
        };
        debug_assert!(Arc::ptr_eq(&head, &self.task.first_task()));

        self.chain.seal();
        self.chain.core()?.post_coro_task(head)?;
        Ok(self)
    }

    // --- Thread-waiting reads ---

    /// Blocks until this stage resolves and clones its value out.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        let state = self.chain.typed_state::<T>(self.stage)?;
        state.wait()?;
        state.try_value()
    }

    pub fn wait(&self) -> Result<()> {
        self.chain.promise_at(self.stage)?.wait()
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<WaitStatus> {
        self.chain.promise_at(self.stage)?.wait_for(timeout)
    }

    fn index(&self, num: i32) -> Result<usize> {
        self.chain.index(self.stage, num)
    }

    pub fn get_at<U: Clone + Send + 'static>(&self, num: i32) -> Result<U> {
        let state = self.chain.typed_state::<U>(self.index(num)?)?;
        state.wait()?;
        state.try_value()
    }

    /// Borrowed access to stage `num`'s value, without cloning.
    pub fn get_ref_at<U: Send + 'static, R>(&self, num: i32, f: impl FnOnce(&U) -> R) -> Result<R> {
        let state = self.chain.typed_state::<U>(self.index(num)?)?;
        state.wait()?;
        state.with_value(f)
    }

    pub fn get_prev<U: Clone + Send + 'static>(&self) -> Result<U> {
        self.get_at(-1)
    }

    pub fn wait_at(&self, num: i32) -> Result<()> {
        self.chain.promise_at(self.index(num)?)?.wait()
    }

    pub fn wait_for_at(&self, num: i32, timeout: Duration) -> Result<WaitStatus> {
        self.chain.promise_at(self.index(num)?)?.wait_for(timeout)
    }

    /// Waits for every stage of the chain, ignoring their outcomes.
    pub fn wait_all(&self) -> Result<()> {
        for index in 0..self.chain.len() {
            self.chain.promise_at(index)?.wait()?;
        }
        Ok(())
    }

    // --- Coroutine-waiting reads, for cross-chain composition ---

    /// Waits for this stage from inside another cooperative task, using
    /// that task's yield handle.
    pub fn wait_coro(&self, sync: &CoroSync) -> Result<()> {
        self.chain.promise_at(self.stage)?.wait_coro(sync)
    }

    pub fn wait_for_coro(&self, sync: &CoroSync, timeout: Duration) -> Result<WaitStatus> {
        self.chain.promise_at(self.stage)?.wait_for_coro(sync, timeout)
    }

    pub fn get_coro(&self, sync: &CoroSync) -> Result<T>
    where
        T: Clone,
    {
        let state = self.chain.typed_state::<T>(self.stage)?;
        state.wait_coro(sync)?;
        state.try_value()
    }

    // --- Buffer consumption from outside the pool ---

    /// Blocking pull from this stage's buffer. `None` once the buffer is
    /// closed and drained.
    pub fn pull(&self) -> Result<Option<T>> {
        self.chain.typed_state::<T>(self.stage)?.pull()
    }

    /// Thread-waiting push into this stage's buffer, for producers outside
    /// the cooperative pool.
    pub fn push(&self, value: T) -> Result<()> {
        self.chain.typed_state::<T>(self.stage)?.push(value)
    }

    /// Fails every unresolved promise of the chain with `Terminated` and
    /// refuses new stages. The currently running stage body (if any) is not
    /// interrupted; the chain walker reaps it at its next completion.
    pub fn terminate(&self) {
        self.chain.terminate();
    }
}
