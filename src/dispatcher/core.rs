use crate::context::{ChainState, CoroContext, ThreadContext, bind_buffered_stage, bind_value_stage};
use crate::dispatcher::DispatcherConfig;
use crate::errors::{DispatcherError, Result};
use crate::future::{Future, Promise};
use crate::queue::{IoQueue, QueueId, QueueStatistics, QueueType, TaskQueue};
use crate::task::{IoJob, IoTask, Task, TaskType};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, trace};

/// Owns every queue of the dispatcher and routes submissions onto them.
///
/// Cooperative queues are statically bound 1:1 to worker threads. I/O
/// queues come in two flavours sharing one type: one *affine* queue per
/// I/O worker plus a pool of *shared* queues drained by any idle worker.
pub(crate) struct DispatcherCore {
    cfg: DispatcherConfig,
    coro_queues: Vec<TaskQueue>,
    io_queues: Vec<IoQueue>,
    shared_io_queues: Vec<IoQueue>,
    /// Rotating index for the shared-queue balancer. Lives on the instance
    /// so independent dispatchers stay independent.
    io_rr_index: AtomicUsize,
    terminated: AtomicBool,
}

impl DispatcherCore {
    pub(crate) fn new(cfg: DispatcherConfig) -> Arc<Self> {
        let coro_queues: Vec<_> = (0..cfg.num_coro_queues).map(|_| TaskQueue::new()).collect();
        if cfg.pin_to_cores {
            let cores = thread::available_parallelism().map_or(1, |n| n.get());
            for (index, queue) in coro_queues.iter().enumerate() {
                queue.pin_to_core(index % cores);
            }
        }

        let io_queues = (0..cfg.num_io_queues).map(|_| IoQueue::new(None)).collect();
        let shared_io_queues = (0..cfg.num_io_queues)
            .map(|_| IoQueue::new(cfg.shared_io_queue_bound))
            .collect();

        Arc::new(Self {
            cfg,
            coro_queues,
            io_queues,
            shared_io_queues,
            io_rr_index: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
        })
    }

    pub(crate) fn cfg(&self) -> &DispatcherConfig {
        &self.cfg
    }

    pub(crate) fn coro_stack_size(&self) -> usize {
        self.cfg.coro_stack_size
    }

    pub(crate) fn num_coroutine_threads(&self) -> usize {
        self.coro_queues.len()
    }

    pub(crate) fn num_io_threads(&self) -> usize {
        self.io_queues.len()
    }

    pub(crate) fn coro_queue_id_range_for_any(&self) -> (usize, usize) {
        self.cfg.any_range
    }

    // --- Routing ---

    /// Routes a cooperative task onto its queue. `Any` picks the first
    /// queue with the smallest size within the configured range, breaking
    /// ties by lowest index and short-circuiting on the first empty queue;
    /// the selected id is written back so the task never migrates again.
    pub(crate) fn post_coro_task(&self, task: Arc<Task>) -> Result<()> {
        match task.queue_id() {
            QueueId::Any => {
                let index = self.select_any_queue();
                task.set_queue_id(QueueId::Id(index));
            }
            QueueId::Id(id) if id < self.coro_queues.len() => {}
            other => {
                return Err(DispatcherError::InvalidQueueId {
                    id: other.encode(),
                    num_queues: self.coro_queues.len(),
                });
            }
        }

        let QueueId::Id(id) = task.queue_id() else {
            unreachable!("queue id resolved above");
        };
        trace!(queue_id = id, "posting cooperative task");
        let high_priority = task.is_high_priority();
        self.coro_queues[id].enqueue(task, high_priority);
        Ok(())
    }

    fn select_any_queue(&self) -> usize {
        let (lo, hi) = self.cfg.any_range;
        let mut index = lo;
        let mut smallest = usize::MAX;
        for candidate in lo..hi {
            let size = self.coro_queues[candidate].size();
            if size < smallest {
                smallest = size;
                index = candidate;
            }
            if smallest == 0 {
                break;
            }
        }
        index
    }

    /// Puts a previously blocked task back on its (already resolved) queue.
    pub(crate) fn requeue_coro_task(&self, task: Arc<Task>) {
        match task.queue_id() {
            QueueId::Id(id) => {
                if let Some(queue) = self.coro_queues.get(id) {
                    queue.requeue_woken(task);
                }
            }
            _ => debug_assert!(false, "woken task without a resolved queue id"),
        }
    }

    pub(crate) fn post_io_task(&self, task: Arc<IoTask>) -> Result<()> {
        let high_priority = task.is_high_priority();
        match task.queue_id() {
            QueueId::Any => {
                if self.cfg.load_balance_shared_io {
                    // Rotate across the shared queues until one accepts.
                    // Deliberately unbounded under sustained overload; see
                    // the design notes.
                    loop {
                        let index = self.io_rr_index.fetch_add(1, Ordering::Relaxed)
                            % self.shared_io_queues.len();
                        if self.shared_io_queues[index].try_enqueue(task.clone(), high_priority) {
                            break;
                        }
                    }
                } else {
                    self.shared_io_queues[0].enqueue(task, high_priority);
                }
                // Wake every affine worker so any idle one drains the
                // shared pool.
                for queue in &self.io_queues {
                    queue.signal_empty_condition(false);
                }
                Ok(())
            }
            QueueId::Id(id) if id < self.io_queues.len() => {
                self.io_queues[id].enqueue(task, high_priority);
                Ok(())
            }
            other => Err(DispatcherError::InvalidQueueId {
                id: other.encode(),
                num_queues: self.io_queues.len(),
            }),
        }
    }

    // --- Submission factories ---

    fn validate_coro_target(&self, queue_id: QueueId) -> Result<()> {
        match queue_id {
            QueueId::Any => Ok(()),
            QueueId::Id(id) if id < self.coro_queues.len() => Ok(()),
            other => Err(DispatcherError::InvalidQueueId {
                id: other.encode(),
                num_queues: self.coro_queues.len(),
            }),
        }
    }

    /// Builds a chain head around `f`. Standalone heads are sealed and
    /// submitted immediately; chain heads wait for `end()`.
    pub(crate) fn create_chain<T, F>(
        self: &Arc<Self>,
        queue_id: QueueId,
        high_priority: bool,
        standalone: bool,
        f: F,
    ) -> Result<ThreadContext<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CoroContext<T>) -> anyhow::Result<T> + Send + 'static,
    {
        if self.is_terminated() {
            return Err(DispatcherError::Terminated);
        }
        self.validate_coro_target(queue_id)?;

        let chain = ChainState::new(Arc::downgrade(self));
        let stage = chain.push_promise(Arc::new(Promise::<T>::new()));
        let body = bind_value_stage::<T, F>(chain.clone(), stage, f);
        let task = Task::new(
            &chain,
            stage,
            TaskType::First,
            queue_id,
            high_priority,
            self.cfg.coro_stack_size,
            body,
        )?;

        match standalone {
            true => {
                chain.seal();
                self.post_coro_task(task.clone())?;
                Ok(ThreadContext::new(chain, stage, task, None))
            }
            false => Ok(ThreadContext::new(chain, stage, task.clone(), Some(task))),
        }
    }

    /// Chain head whose first stage streams values through a buffer-mode
    /// promise instead of resolving a single value.
    pub(crate) fn create_buffered_chain<T, F>(
        self: &Arc<Self>,
        queue_id: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<ThreadContext<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CoroContext<T>) -> anyhow::Result<()> + Send + 'static,
    {
        if self.is_terminated() {
            return Err(DispatcherError::Terminated);
        }
        self.validate_coro_target(queue_id)?;

        let chain = ChainState::new(Arc::downgrade(self));
        let stage =
            chain.push_promise(Arc::new(Promise::<T>::new_buffer(self.cfg.buffer_capacity)));
        let body = bind_buffered_stage::<T, F>(chain.clone(), stage, f);
        let task = Task::new(
            &chain,
            stage,
            TaskType::First,
            queue_id,
            high_priority,
            self.cfg.coro_stack_size,
            body,
        )?;
        Ok(ThreadContext::new(chain, stage, task.clone(), Some(task)))
    }

    /// Wraps a blocking job for the I/O pool and submits it. The returned
    /// future resolves with the job's outcome.
    pub(crate) fn create_io_future<T, F>(
        self: &Arc<Self>,
        queue_id: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        if self.is_terminated() {
            return Err(DispatcherError::Terminated);
        }
        match queue_id {
            QueueId::Any => {}
            QueueId::Id(id) if id < self.io_queues.len() => {}
            other => {
                return Err(DispatcherError::InvalidQueueId {
                    id: other.encode(),
                    num_queues: self.io_queues.len(),
                });
            }
        }

        let promise = Promise::<T>::new();
        let future = promise.future();
        let job: IoJob = Box::new(move || match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => {
                let _ = promise.set(value);
                Ok(())
            }
            Ok(Err(err)) => {
                let err = DispatcherError::user(err);
                let _ = promise.set_exception(err.clone());
                Err(err)
            }
            Err(panic) => {
                let err = crate::utils::panic_to_error(panic);
                let _ = promise.set_exception(err.clone());
                Err(err)
            }
        });

        self.post_io_task(Arc::new(IoTask::new(queue_id, high_priority, job)))?;
        Ok(future)
    }

    // --- Worker support ---

    pub(crate) fn coro_queue(&self, id: usize) -> &TaskQueue {
        &self.coro_queues[id]
    }

    pub(crate) fn io_queue(&self, id: usize) -> &IoQueue {
        &self.io_queues[id]
    }

    /// Scans the shared pool for work, starting at `start` for fairness
    /// across workers.
    pub(crate) fn steal_shared_io(&self, start: usize) -> Option<(&IoQueue, Arc<IoTask>)> {
        let len = self.shared_io_queues.len();
        for offset in 0..len {
            let queue = &self.shared_io_queues[(start + offset) % len];
            if let Some(task) = queue.try_dequeue() {
                return Some((queue, task));
            }
        }
        None
    }

    pub(crate) fn shared_io_empty(&self) -> bool {
        self.shared_io_queues.iter().all(|queue| queue.empty())
    }

    // --- Queries ---

    pub(crate) fn size(&self, queue_type: QueueType, queue_id: QueueId) -> Result<usize> {
        match queue_type {
            QueueType::All => {
                ensure_aggregate_id(queue_id)?;
                Ok(self.coro_size(QueueId::All)? + self.io_size(QueueId::All)?)
            }
            QueueType::Coro => self.coro_size(queue_id),
            QueueType::Io => self.io_size(queue_id),
        }
    }

    pub(crate) fn empty(&self, queue_type: QueueType, queue_id: QueueId) -> Result<bool> {
        match queue_type {
            QueueType::All => {
                ensure_aggregate_id(queue_id)?;
                Ok(self.coro_empty(QueueId::All)? && self.io_empty(QueueId::All)?)
            }
            QueueType::Coro => self.coro_empty(queue_id),
            QueueType::Io => self.io_empty(queue_id),
        }
    }

    pub(crate) fn stats(&self, queue_type: QueueType, queue_id: QueueId) -> Result<QueueStatistics> {
        match queue_type {
            QueueType::All => {
                ensure_aggregate_id(queue_id)?;
                Ok(self.coro_stats(QueueId::All)? + self.io_stats(QueueId::All)?)
            }
            QueueType::Coro => self.coro_stats(queue_id),
            QueueType::Io => self.io_stats(queue_id),
        }
    }

    pub(crate) fn reset_stats(&self) {
        for queue in &self.coro_queues {
            queue.reset_stats();
        }
        for queue in &self.io_queues {
            queue.reset_stats();
        }
        for queue in &self.shared_io_queues {
            queue.reset_stats();
        }
    }

    fn coro_size(&self, queue_id: QueueId) -> Result<usize> {
        match queue_id {
            QueueId::All => Ok(self.coro_queues.iter().map(|q| q.size()).sum()),
            QueueId::Id(id) if id < self.coro_queues.len() => Ok(self.coro_queues[id].size()),
            other => Err(DispatcherError::InvalidQueueId {
                id: other.encode(),
                num_queues: self.coro_queues.len(),
            }),
        }
    }

    fn coro_empty(&self, queue_id: QueueId) -> Result<bool> {
        match queue_id {
            QueueId::All => Ok(self.coro_queues.iter().all(|q| q.empty())),
            QueueId::Id(id) if id < self.coro_queues.len() => Ok(self.coro_queues[id].empty()),
            other => Err(DispatcherError::InvalidQueueId {
                id: other.encode(),
                num_queues: self.coro_queues.len(),
            }),
        }
    }

    fn coro_stats(&self, queue_id: QueueId) -> Result<QueueStatistics> {
        match queue_id {
            QueueId::All => Ok(self
                .coro_queues
                .iter()
                .fold(QueueStatistics::default(), |acc, q| acc + q.stats())),
            QueueId::Id(id) if id < self.coro_queues.len() => Ok(self.coro_queues[id].stats()),
            other => Err(DispatcherError::InvalidQueueId {
                id: other.encode(),
                num_queues: self.coro_queues.len(),
            }),
        }
    }

    /// `Any` aggregates the shared pool; it is only meaningful for I/O
    /// queries.
    fn io_size(&self, queue_id: QueueId) -> Result<usize> {
        match queue_id {
            QueueId::All => Ok(self
                .io_queues
                .iter()
                .chain(&self.shared_io_queues)
                .map(|q| q.size())
                .sum()),
            QueueId::Any => Ok(self.shared_io_queues.iter().map(|q| q.size()).sum()),
            QueueId::Id(id) if id < self.io_queues.len() => Ok(self.io_queues[id].size()),
            other => Err(DispatcherError::InvalidQueueId {
                id: other.encode(),
                num_queues: self.io_queues.len(),
            }),
        }
    }

    fn io_empty(&self, queue_id: QueueId) -> Result<bool> {
        match queue_id {
            QueueId::All => Ok(self
                .io_queues
                .iter()
                .chain(&self.shared_io_queues)
                .all(|q| q.empty())),
            QueueId::Any => Ok(self.shared_io_empty()),
            QueueId::Id(id) if id < self.io_queues.len() => Ok(self.io_queues[id].empty()),
            other => Err(DispatcherError::InvalidQueueId {
                id: other.encode(),
                num_queues: self.io_queues.len(),
            }),
        }
    }

    fn io_stats(&self, queue_id: QueueId) -> Result<QueueStatistics> {
        match queue_id {
            QueueId::All => Ok(self
                .io_queues
                .iter()
                .chain(&self.shared_io_queues)
                .fold(QueueStatistics::default(), |acc, q| acc + q.stats())),
            QueueId::Any => Ok(self
                .shared_io_queues
                .iter()
                .fold(QueueStatistics::default(), |acc, q| acc + q.stats())),
            QueueId::Id(id) if id < self.io_queues.len() => Ok(self.io_queues[id].stats()),
            other => Err(DispatcherError::InvalidQueueId {
                id: other.encode(),
                num_queues: self.io_queues.len(),
            }),
        }
    }

    // --- Termination ---

    /// Idempotent: terminates every owned queue; workers exit once their
    /// queues drain.
    pub(crate) fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            debug!("terminating dispatcher queues");
            for queue in &self.coro_queues {
                queue.terminate();
            }
            for queue in &self.io_queues {
                queue.terminate();
            }
            for queue in &self.shared_io_queues {
                queue.terminate();
            }
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

fn ensure_aggregate_id(queue_id: QueueId) -> Result<()> {
    match queue_id {
        QueueId::All => Ok(()),
        _ => Err(DispatcherError::InvalidArgument(
            "the aggregate queue type cannot be combined with a queue id",
        )),
    }
}
