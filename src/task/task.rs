use crate::context::ChainState;
use crate::errors::{DispatcherError, Result};
use crate::queue::QueueId;
use crate::task::{RunResult, SuspendReason, TaskType};
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Weak};

/// What a finished stage body reports to the worker. The body has already
/// resolved its own stage promise; the error here only steers the chain
/// walker.
pub(crate) type TaskResult = std::result::Result<(), DispatcherError>;

type TaskCoro = Coroutine<(), SuspendReason, TaskResult, DefaultStack>;

/// A runnable stage of a continuation chain, backed by a stackful coroutine.
///
/// A task sits in exactly one queue or runs on exactly one worker at any
/// instant, so its mutable state is only ever touched from one thread at a
/// time. The continuation chain is owned head-down through `next`; `prev`
/// is a non-owning back-reference.
pub(crate) struct Task {
    /// Non-owning accessor to the chain; the body closure holds the strong
    /// reference for as long as the task can still run.
    chain: Weak<ChainState>,
    stage: usize,
    task_type: TaskType,
    high_priority: bool,
    /// Sentinel-encoded `QueueId`. `Any` is overwritten with the selected
    /// queue on first dispatch; pinning then forbids migration.
    queue_id: AtomicIsize,
    coro: Mutex<Option<TaskCoro>>,
    next: Mutex<Option<Arc<Task>>>,
    prev: Mutex<Weak<Task>>,
}

// Safety: the body closure and everything it captures are required to be
// Send at construction, and a task's coroutine is only ever resumed by one
// worker at a time (single ownership through the queues).
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    pub(crate) fn new<B>(
        chain: &Arc<ChainState>,
        stage: usize,
        task_type: TaskType,
        queue_id: QueueId,
        high_priority: bool,
        stack_size: usize,
        body: B,
    ) -> Result<Arc<Task>>
    where
        B: FnOnce(&Yielder<(), SuspendReason>, ()) -> TaskResult + Send + 'static,
    {
        let stack = DefaultStack::new(stack_size)
            .map_err(|e| DispatcherError::Resource(format!("coroutine stack: {e}")))?;
        Ok(Arc::new(Task {
            chain: Arc::downgrade(chain),
            stage,
            task_type,
            high_priority,
            queue_id: AtomicIsize::new(queue_id.encode()),
            coro: Mutex::new(Some(Coroutine::with_stack(stack, body))),
            next: Mutex::new(None),
            prev: Mutex::new(Weak::new()),
        }))
    }

    /// Resumes the coroutine until its next suspension point or completion.
    pub(crate) fn run(&self) -> RunResult {
        let mut coro = self.coro.lock();
        let Some(active) = coro.as_mut() else {
            // Already finished; a stale wake-up resumes nothing.
            return RunResult::Success;
        };
        match active.resume(()) {
            CoroutineResult::Yield(SuspendReason::Yielded) => RunResult::Yielded,
            CoroutineResult::Yield(SuspendReason::Blocked) => RunResult::Blocked,
            CoroutineResult::Return(result) => {
                // Drop the coroutine and its captured state eagerly.
                *coro = None;
                match result {
                    Ok(()) => RunResult::Success,
                    Err(err) => RunResult::Exception(err),
                }
            }
        }
    }

    pub(crate) fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub(crate) fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    pub(crate) fn queue_id(&self) -> QueueId {
        QueueId::decode(self.queue_id.load(Ordering::Acquire))
    }

    pub(crate) fn set_queue_id(&self, queue_id: QueueId) {
        self.queue_id.store(queue_id.encode(), Ordering::Release);
    }

    /// Identity of this task for yield-handle validation: the chain
    /// allocation address plus the stage index.
    pub(crate) fn token(&self) -> (usize, usize) {
        (self.chain.as_ptr() as usize, self.stage)
    }

    pub(crate) fn set_next(&self, next: Arc<Task>) {
        *self.next.lock() = Some(next);
    }

    /// Detaches and returns the continuation, transferring chain ownership
    /// to the caller.
    pub(crate) fn take_next(&self) -> Option<Arc<Task>> {
        self.next.lock().take()
    }

    pub(crate) fn set_prev(&self, prev: &Arc<Task>) {
        *self.prev.lock() = Arc::downgrade(prev);
    }

    /// Walks `prev` links back to the head of the chain.
    pub(crate) fn first_task(self: &Arc<Self>) -> Arc<Task> {
        let mut current = self.clone();
        loop {
            let prev = current.prev.lock().upgrade();
            match prev {
                Some(prev) => current = prev,
                None => return current,
            }
        }
    }

    /// Resolves this stage's promise when the stage is skipped by the chain
    /// walker instead of run.
    pub(crate) fn release_skipped(&self, err: DispatcherError) {
        if let Some(chain) = self.chain.upgrade() {
            chain.fail_stage(self.stage, err);
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // A task dropped before it could complete (queue drained at
        // termination, chain reaped) resolves its stage as terminated.
        // No-op when the stage already resolved.
        if let Some(chain) = self.chain.upgrade() {
            chain.fail_stage(self.stage, DispatcherError::Terminated);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("stage", &self.stage)
            .field("type", &self.task_type)
            .field("queue_id", &self.queue_id())
            .finish()
    }
}
