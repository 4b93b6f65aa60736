use crate::queue::{QueueStatistics, TaskOutcome};
use crate::task::IoTask;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Inner {
    high: VecDeque<Arc<IoTask>>,
    normal: VecDeque<Arc<IoTask>>,
    /// Number of consumers currently executing a task taken from this queue.
    /// Shared queues are drained by every I/O worker, so this is a count.
    running: usize,
    stats: QueueStatistics,
}

impl Inner {
    fn pop(&mut self) -> Option<Arc<IoTask>> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }
}

/// Queue of blocking I/O tasks. The same type backs both variants: *affine*
/// queues have a single consumer (their worker thread), *shared* queues are
/// drained by any idle I/O worker.
pub(crate) struct IoQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    /// Enqueue bound honoured by `try_enqueue` (the load balancer path).
    /// `None` means unbounded.
    bound: Option<usize>,
    terminated: AtomicBool,
}

impl IoQueue {
    pub(crate) fn new(bound: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            not_empty: Condvar::new(),
            bound,
            terminated: AtomicBool::new(false),
        }
    }

    pub(crate) fn enqueue(&self, task: Arc<IoTask>, high_priority: bool) {
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

    /// Non-blocking admission used by the shared-queue round-robin balancer.
    /// Returns `false` when the configured bound would be exceeded.
    pub(crate) fn try_enqueue(&self, task: Arc<IoTask>, high_priority: bool) -> bool {
        {
            let mut inner = self.inner.lock();
            if let Some(bound) = self.bound {
                if inner.len() >= bound {
                    return false;
                }
            }
            inner.stats.posted_count += 1;
            if high_priority {
                inner.stats.high_priority_count += 1;
                inner.high.push_back(task);
            } else {
                inner.normal.push_back(task);
            }
        }
        self.not_empty.notify_one();
        true
    }

    /// Non-blocking dequeue used by the worker drain loop.
    pub(crate) fn try_dequeue(&self) -> Option<Arc<IoTask>> {
        let mut inner = self.inner.lock();
        let task = inner.pop()?;
        inner.running += 1;
        Some(task)
    }

    pub(crate) fn task_done(&self, outcome: TaskOutcome) {
        let mut inner = self.inner.lock();
        inner.running -= 1;
        match outcome {
            TaskOutcome::Completed => inner.stats.completed_count += 1,
            TaskOutcome::Errored => inner.stats.error_count += 1,
            TaskOutcome::Suspended => {}
        }
    }

    /// Parks the calling worker until a signal arrives or `timeout` elapses.
    /// Returns immediately when work is already queued or the queue is
    /// terminated. The timeout bounds the window of a wake-up racing the
    /// worker's shared-pool scan.
    pub(crate) fn wait_for_work(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        if inner.len() == 0 && !self.terminated.load(Ordering::Acquire) {
            let _ = self.not_empty.wait_for(&mut inner, timeout);
        }
    }

    /// Wakes idle consumers. Every shared-pool post signals all affine
    /// queues through this so any idle worker can pick the task up.
    pub(crate) fn signal_empty_condition(&self, drain: bool) {
        self.inner.lock().stats.signal_count += 1;
        if drain {
            self.not_empty.notify_all();
        } else {
            self.not_empty.notify_one();
        }
    }

    /// Number of queued tasks, including currently executing ones.
    pub(crate) fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.len() + inner.running
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

    pub(crate) fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.not_empty.notify_all();
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}
