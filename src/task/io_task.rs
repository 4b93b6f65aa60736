use crate::errors::DispatcherError;
use crate::queue::QueueId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicIsize, Ordering};

/// The boxed blocking job. It resolves the promise it captured and reports
/// the error (if any) back to the worker for queue bookkeeping.
pub(crate) type IoJob = Box<dyn FnOnce() -> Result<(), DispatcherError> + Send>;

/// A blocking task run to completion on the preemptive I/O pool. Unlike
/// cooperative tasks it is not wrapped in a coroutine and never yields.
pub(crate) struct IoTask {
    queue_id: AtomicIsize,
    high_priority: bool,
    job: Mutex<Option<IoJob>>,
}

impl IoTask {
    pub(crate) fn new(queue_id: QueueId, high_priority: bool, job: IoJob) -> Self {
        Self {
            queue_id: AtomicIsize::new(queue_id.encode()),
            high_priority,
            job: Mutex::new(Some(job)),
        }
    }

    pub(crate) fn queue_id(&self) -> QueueId {
        QueueId::decode(self.queue_id.load(Ordering::Acquire))
    }

    pub(crate) fn is_high_priority(&self) -> bool {
        self.high_priority
    }

    pub(crate) fn run(&self) -> Result<(), DispatcherError> {
        match self.job.lock().take() {
            Some(job) => job(),
            None => Ok(()),
        }
    }
}
