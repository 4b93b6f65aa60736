//! Thread-local registry of the worker and task running on this thread.
//!
//! This is how waiting primitives decide between the two wait families:
//! thread-blocking forms refuse to run on a thread that is currently inside
//! a cooperative task (`BadContext`), and coroutine-waiting forms validate
//! the caller's yield handle against the task actually running here.

use crate::dispatcher::core::DispatcherCore;
use crate::errors::{DispatcherError, Result};
use crate::future::WakerFn;
use crate::queue::QueueId;
use crate::task::Task;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

#[derive(Clone, Copy, Debug)]
pub(crate) enum WorkerKind {
    Cooperative { queue_id: usize },
    Io { queue_id: usize },
}

pub(crate) struct WorkerRegistration {
    pub(crate) core: Weak<DispatcherCore>,
    pub(crate) kind: WorkerKind,
}

thread_local! {
    static WORKER: RefCell<Option<WorkerRegistration>> = const { RefCell::new(None) };
    static ACTIVE_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

/// Called once at the top of every worker thread.
pub(crate) fn register_worker(core: Weak<DispatcherCore>, kind: WorkerKind) {
    tracing::trace!(?kind, "worker registered");
    WORKER.with(|worker| {
        *worker.borrow_mut() = Some(WorkerRegistration { core, kind });
    });
}

/// Marks `task` as running on this thread for the duration of one resume.
/// The returned guard clears the slot when the task yields, blocks or
/// completes.
pub(crate) fn enter_task(task: &Arc<Task>) -> ActiveTaskGuard {
    debug_assert!(
        WORKER.with(|worker| {
            matches!(
                worker.borrow().as_ref().map(|reg| reg.kind),
                Some(WorkerKind::Cooperative { .. })
            )
        }),
        "tasks only run on cooperative workers"
    );
    ACTIVE_TASK.with(|active| {
        *active.borrow_mut() = Some(task.clone());
    });
    ActiveTaskGuard(())
}

pub(crate) struct ActiveTaskGuard(());

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        ACTIVE_TASK.with(|active| {
            *active.borrow_mut() = None;
        });
    }
}

/// Whether the calling code is executing inside a cooperative task.
pub(crate) fn is_coroutine_context() -> bool {
    ACTIVE_TASK.with(|active| active.borrow().is_some())
}

/// Thread-blocking waits are only permitted outside cooperative tasks.
pub(crate) fn ensure_thread_context() -> Result<()> {
    match is_coroutine_context() {
        true => Err(DispatcherError::BadContext),
        false => Ok(()),
    }
}

/// Identity of the task currently running on this thread, for yield-handle
/// validation.
pub(crate) fn active_token() -> Option<(usize, usize)> {
    ACTIVE_TASK.with(|active| active.borrow().as_ref().map(|task| task.token()))
}

/// Builds a one-shot callback that re-enqueues the currently running task
/// onto its queue. Registered with a promise before the task suspends
/// `Blocked`; firing it after the suspension wakes the task.
pub(crate) fn wake_current() -> Result<WakerFn> {
    let task = ACTIVE_TASK
        .with(|active| active.borrow().clone())
        .ok_or(DispatcherError::BadContext)?;
    let core = WORKER
        .with(|worker| worker.borrow().as_ref().map(|reg| reg.core.clone()))
        .ok_or(DispatcherError::BadContext)?;

    debug_assert!(
        matches!(task.queue_id(), QueueId::Id(_)),
        "a running task must have a resolved queue id"
    );

    Ok(Box::new(move || {
        // The dispatcher may be gone by the time the promise resolves; the
        // task is then reaped by its own drop.
        if let Some(core) = core.upgrade() {
            core.requeue_coro_task(task);
        }
    }))
}
