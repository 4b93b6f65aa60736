mod stats;
pub use stats::QueueStatistics;

pub(crate) mod io_queue;
pub(crate) use io_queue::IoQueue;

pub(crate) mod task_queue;
pub(crate) use task_queue::TaskQueue;

/// Addresses a queue in submission and query APIs.
///
/// `Any` lets the dispatcher choose the target queue at submission time.
/// `All` is an aggregation sentinel for queries and is never a task target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    Any,
    All,
    Id(usize),
}

impl QueueId {
    pub(crate) fn encode(self) -> isize {
        match self {
            QueueId::Any => -1,
            QueueId::All => -2,
            QueueId::Id(id) => id as isize,
        }
    }

    pub(crate) fn decode(raw: isize) -> QueueId {
        match raw {
            -1 => QueueId::Any,
            -2 => QueueId::All,
            id => {
                debug_assert!(id >= 0, "corrupted queue id encoding");
                QueueId::Id(id as usize)
            }
        }
    }
}

/// Selects which worker pool a query applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    All,
    Coro,
    Io,
}

/// How a dequeued task left its worker, reported back to the queue for
/// bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    Completed,
    Errored,
    Suspended,
}
