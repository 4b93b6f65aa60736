use crate::queue::{QueueStatistics, TaskOutcome};
use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct Inner {
    /// High-priority sub-queue served ahead of normal tasks, FIFO among
    /// themselves.
    high: VecDeque<Arc<Task>>,
    normal: VecDeque<Arc<Task>>,
    /// Whether the consumer is currently executing a dequeued task. Counted
    /// by `size()` so that a queue with a running task never reads as empty.
    running: bool,
    stats: QueueStatistics,
}

impl Inner {
    fn pop(&mut self) -> Option<Arc<Task>> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }
}

/// Cooperative task queue: many producers, a single consumer (the worker
/// thread statically bound to this queue).
pub(crate) struct TaskQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    terminated: AtomicBool,
    pinned_core: Mutex<Option<usize>>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            not_empty: Condvar::new(),
            terminated: AtomicBool::new(false),
            pinned_core: Mutex::new(None),
        }
    }

    /// Admits a task. High-priority tasks join the head sub-queue, behind
    /// earlier high-priority tasks but ahead of all normal ones.
    pub(crate) fn enqueue(&self, task: Arc<Task>, high_priority: bool) {
        {
            let mut inner = self.inner.lock();
            inner.stats.posted_count += 1;
            if high_priority {
                inner.stats.high_priority_count += 1;
                inner.high.push_back(task);
            } else {
                inner.normal.push_back(task);
            }
        }
        self.not_empty.notify_one();
    }

    /// Puts a yielded or woken task back at the tail, at normal priority.
    /// Priority is an admission hint and is not inherited on re-enqueue.
    ///
    /// Also clears the consumer's `running` flag in the same critical
    /// section: the yielded task stays visible in `size()` throughout.
    pub(crate) fn requeue_yielded(&self, task: Arc<Task>) {
        {
            let mut inner = self.inner.lock();
            inner.normal.push_back(task);
            inner.running = false;
        }
        self.not_empty.notify_one();
    }

    /// Re-enqueues a previously blocked task woken by a promise resolution.
    pub(crate) fn requeue_woken(&self, task: Arc<Task>) {
        {
            let mut inner = self.inner.lock();
            inner.normal.push_back(task);
        }
        self.not_empty.notify_one();
    }

    /// Blocking dequeue. Returns `None` once the queue is terminated and all
    /// remaining items have been served; the worker uses this to exit.
    pub(crate) fn dequeue(&self) -> Option<Arc<Task>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(task) = inner.pop() {
                inner.running = true;
                return Some(task);
            }
            if self.terminated.load(Ordering::Acquire) {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Consumer bookkeeping after the dequeued task left the worker through
    /// a path other than `requeue_yielded`.
    pub(crate) fn task_done(&self, outcome: TaskOutcome) {
        let mut inner = self.inner.lock();
        inner.running = false;
        match outcome {
            TaskOutcome::Completed => inner.stats.completed_count += 1,
            TaskOutcome::Errored => inner.stats.error_count += 1,
            TaskOutcome::Suspended => {}
        }
    }

    /// Wakes the consumer even if the queue is empty. `drain` wakes
    /// unconditionally and is used during termination.
    pub(crate) fn signal_empty_condition(&self, drain: bool) {
        self.inner.lock().stats.signal_count += 1;
        if drain {
            self.not_empty.notify_all();
        } else {
            self.not_empty.notify_one();
        }
    }

    /// Number of queued tasks, including the currently executing one.
    pub(crate) fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.len() + inner.running as usize
    }

    pub(crate) fn empty(&self) -> bool {
        self.size() == 0
    }

    pub(crate) fn stats(&self) -> QueueStatistics {
        self.inner.lock().stats
    }

    pub(crate) fn reset_stats(&self) {
        self.inner.lock().stats.reset();
    }

    /// Requests that the consumer thread pin itself to `core` on startup.
    pub(crate) fn pin_to_core(&self, core: usize) {
        *self.pinned_core.lock() = Some(core);
    }

    pub(crate) fn pinned_core(&self) -> Option<usize> {
        *self.pinned_core.lock()
    }

    /// Transitions the queue to its drained state: remaining items are still
    /// served, after which `dequeue` returns `None`.
    pub(crate) fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.not_empty.notify_all();
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}
