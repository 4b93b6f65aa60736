use crate::dispatcher::core::DispatcherCore;
use crate::context::current::{self, WorkerKind};
use crate::errors::DispatcherError;
use crate::queue::TaskOutcome;
use crate::task::{RunResult, Task, TaskType};
use crate::utils;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error};

/// Spawns the cooperative worker serving queue `queue_id`.
pub(crate) fn spawn(core: Arc<DispatcherCore>, queue_id: usize) -> thread::JoinHandle<()> {
    let mut builder = thread::Builder::new().name((core.cfg().thread_name.0)("coro", queue_id));
    if let Some(stack_size) = core.cfg().thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .spawn(move || {
            if let Some(core_id) = core.coro_queue(queue_id).pinned_core() {
                utils::thread::pin_current_thread_to_core(core_id);
            }
            current::register_worker(Arc::downgrade(&core), WorkerKind::Cooperative { queue_id });
            run_loop(&core, queue_id);
        })
        .expect("failed to spawn worker thread")
}

/// The fixed worker body: dequeue, resume, dispatch on the return code.
/// `dequeue` returns `None` once the queue is terminated and drained.
fn run_loop(core: &Arc<DispatcherCore>, queue_id: usize) {
    let queue = core.coro_queue(queue_id);
    debug!(queue_id, "cooperative worker started");

    while let Some(task) = queue.dequeue() {
        let result = {
            let _active = current::enter_task(&task);
            task.run()
        };
        match result {
            // Back to the tail at normal priority; the queue clears the
            // running flag in the same critical section so the task stays
            // visible in size(). Once the queue is terminated, yielded
            // tasks are not re-admitted: dropping them resolves their
            // chains as terminated, so shutdown converges even against a
            // task that yields forever.
            RunResult::Yielded => match queue.is_terminated() {
                false => queue.requeue_yielded(task),
                true => queue.task_done(TaskOutcome::Suspended),
            },
            // Someone else re-enqueues the task when its wait resolves.
            RunResult::Blocked => queue.task_done(TaskOutcome::Suspended),
            RunResult::Success => {
                queue.task_done(TaskOutcome::Completed);
                dispatch_next(core, task, None);
            }
            RunResult::Exception(err) => {
                queue.task_done(TaskOutcome::Errored);
                dispatch_next(core, task, Some(err));
            }
        }
    }

    debug!(queue_id, "cooperative worker exiting");
}

/// Walks the continuation chain after a stage completed and enqueues the
/// next runnable stage, which may target a different queue than the
/// current worker's.
///
/// On success, error handlers are skipped and released. On failure,
/// intermediate continuations are skipped with their promises failed by
/// the propagated error, until an error handler (which may recover) or the
/// finalizer (which always runs) is found.
fn dispatch_next(core: &Arc<DispatcherCore>, task: Arc<Task>, error: Option<DispatcherError>) {
    let mut next = task.take_next();
    drop(task);

    match error {
        None => {
            while let Some(candidate) = next {
                match candidate.task_type() {
                    TaskType::ErrorHandler => {
                        candidate.release_skipped(DispatcherError::Terminated);
                        next = candidate.take_next();
                    }
                    _ => {
                        post_next(core, candidate);
                        return;
                    }
                }
            }
        }
        // A terminated chain is reaped: dropping the links resolves every
        // remaining stage.
        Some(err) if err.is_terminated() => {}
        Some(err) => {
            while let Some(candidate) = next {
                match candidate.task_type() {
                    TaskType::ErrorHandler | TaskType::Final => {
                        post_next(core, candidate);
                        return;
                    }
                    _ => {
                        candidate.release_skipped(err.clone());
                        next = candidate.take_next();
                    }
                }
            }
        }
    }
}

fn post_next(core: &Arc<DispatcherCore>, task: Arc<Task>) {
    if let Err(err) = core.post_coro_task(task) {
        error!(%err, "failed to dispatch continuation");
    }
}
