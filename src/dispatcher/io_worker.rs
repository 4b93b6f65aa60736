use crate::dispatcher::core::DispatcherCore;
use crate::context::current::{self, WorkerKind};
use crate::queue::{IoQueue, TaskOutcome};
use crate::task::IoTask;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Bounds the window in which a wake-up can race the worker's shared-pool
/// scan; an idle worker re-scans at least this often.
const WAIT_FOR_WORK_TIMEOUT: Duration = Duration::from_millis(100);

/// Spawns the I/O worker owning affine queue `queue_id`.
pub(crate) fn spawn(core: Arc<DispatcherCore>, queue_id: usize) -> thread::JoinHandle<()> {
    let mut builder = thread::Builder::new().name((core.cfg().thread_name.0)("io", queue_id));
    if let Some(stack_size) = core.cfg().thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .spawn(move || {
            current::register_worker(Arc::downgrade(&core), WorkerKind::Io { queue_id });
            run_loop(&core, queue_id);
        })
        .expect("failed to spawn worker thread")
}

/// Alternates between draining the worker's own affine queue and the
/// shared pool, FIFO within each. Any producer signal on the affine queue
/// brings the worker out of its wait.
fn run_loop(core: &Arc<DispatcherCore>, queue_id: usize) {
    let own = core.io_queue(queue_id);
    debug!(queue_id, "io worker started");

    loop {
        if let Some(task) = own.try_dequeue() {
            run_task(own, task);
            continue;
        }
        if let Some((queue, task)) = core.steal_shared_io(queue_id) {
            run_task(queue, task);
            continue;
        }
        if own.is_terminated() && own.empty() && core.shared_io_empty() {
            break;
        }
        own.wait_for_work(WAIT_FOR_WORK_TIMEOUT);
    }

    debug!(queue_id, "io worker exiting");
}

fn run_task(queue: &IoQueue, task: Arc<IoTask>) {
    match task.run() {
        Ok(()) => queue.task_done(TaskOutcome::Completed),
        Err(err) => {
            trace!(%err, "io task completed with an error");
            queue.task_done(TaskOutcome::Errored);
        }
    }
}
