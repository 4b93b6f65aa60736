use std::ops::{Add, AddAssign};

/// Counters accumulated by a single queue.
///
/// Counters are updated under the owning queue's lock, so a snapshot is
/// consistent per queue but only eventually consistent when aggregated
/// across queues.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatistics {
    /// Tasks admitted through the dispatcher. Re-enqueues of yielded or
    /// woken tasks are not counted.
    pub posted_count: u64,

    /// Subset of `posted_count` admitted at high priority.
    pub high_priority_count: u64,

    /// Stages that ran to completion successfully.
    pub completed_count: u64,

    /// Stages that completed with an error.
    pub error_count: u64,

    /// Wake signals delivered to this queue's consumer(s).
    pub signal_count: u64,
}

impl QueueStatistics {
    pub fn reset(&mut self) {
        *self = QueueStatistics::default();
    }
}

impl AddAssign for QueueStatistics {
    fn add_assign(&mut self, rhs: QueueStatistics) {
        self.posted_count += rhs.posted_count;
        self.high_priority_count += rhs.high_priority_count;
        self.completed_count += rhs.completed_count;
        self.error_count += rhs.error_count;
        self.signal_count += rhs.signal_count;
    }
}

impl Add for QueueStatistics {
    type Output = QueueStatistics;

    fn add(mut self, rhs: QueueStatistics) -> QueueStatistics {
        self += rhs;
        self
    }
}
