use crate::context::{CoroContext, ThreadContext};
use crate::dispatcher::core::DispatcherCore;
use crate::dispatcher::{coro_worker, io_worker};
use crate::errors::{DispatcherError, Result};
use crate::future::Future;
use crate::queue::{QueueId, QueueStatistics, QueueType};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default number of blocking I/O worker threads.
const DEFAULT_NUM_IO_THREADS: i32 = 5;

/// Stack size for task coroutines. Each cooperative task gets its own
/// stack of this size.
const DEFAULT_CORO_STACK_SIZE: usize = 256 * 1024;

/// Coroutine stacks below this are rejected by the platform or overflow on
/// the first frame.
const MIN_CORO_STACK_SIZE: usize = 32 * 1024;

/// Default capacity of promises opened in buffer mode.
const DEFAULT_BUFFER_CAPACITY: usize = 128;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn(&'static str, usize) -> String + Send + Sync>);

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|kind, id| format!("weft-{kind}-{id}")))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The closure itself is not printable.
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and builds a [`Dispatcher`].
///
/// Configuration methods can be chained on the return value.
#[derive(Debug)]
pub struct Builder {
    /// Number of threads running coroutines. `-1` means one per hardware
    /// concurrency unit; `0` is clamped to one.
    num_coroutine_threads: i32,

    /// Number of threads running blocking I/O calls; values `<= 0` are
    /// clamped to one.
    num_io_threads: i32,

    /// Pin each coroutine worker onto a physical core, wrapping around
    /// when there are more workers than cores.
    pin_coroutine_threads_to_cores: bool,

    /// The `[lo, hi)` range of cooperative queue ids considered when a
    /// submission targets `Any`. Invalid or empty ranges fall back to the
    /// full range.
    coro_queue_id_range_for_any: Option<(usize, usize)>,

    /// Balance `Any` I/O submissions round-robin across the shared queues
    /// instead of funnelling them through shared queue 0.
    load_balance_shared_io_queues: bool,

    /// Bound honoured by the shared-queue balancer's `try_enqueue`;
    /// unbounded when `None`.
    shared_io_queue_bound: Option<usize>,

    coro_stack_size: usize,

    buffer_capacity: usize,

    /// Name fn used for threads spawned by the dispatcher.
    thread_name: ThreadNameFn,

    /// Stack size used for worker OS threads (not coroutine stacks).
    thread_stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            num_coroutine_threads: -1,
            num_io_threads: DEFAULT_NUM_IO_THREADS,
            pin_coroutine_threads_to_cores: false,
            coro_queue_id_range_for_any: None,
            load_balance_shared_io_queues: false,
            shared_io_queue_bound: None,
            coro_stack_size: DEFAULT_CORO_STACK_SIZE,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    pub fn num_coroutine_threads(mut self, val: i32) -> Self {
        self.num_coroutine_threads = val;
        self
    }

    pub fn num_io_threads(mut self, val: i32) -> Self {
        self.num_io_threads = val;
        self
    }

    pub fn pin_coroutine_threads_to_cores(mut self, val: bool) -> Self {
        self.pin_coroutine_threads_to_cores = val;
        self
    }

    pub fn coro_queue_id_range_for_any(mut self, lo: usize, hi: usize) -> Self {
        self.coro_queue_id_range_for_any = Some((lo, hi));
        self
    }

    pub fn load_balance_shared_io_queues(mut self, val: bool) -> Self {
        self.load_balance_shared_io_queues = val;
        self
    }

    pub fn shared_io_queue_bound(mut self, val: usize) -> Self {
        self.shared_io_queue_bound = Some(val);
        self
    }

    /// Sets the stack size (in bytes) for task coroutines. Values below
    /// the platform minimum are clamped up.
    pub fn coro_stack_size(mut self, val: usize) -> Self {
        self.coro_stack_size = val;
        self
    }

    /// Sets the capacity of promises opened in buffer mode.
    pub fn buffer_capacity(mut self, val: usize) -> Self {
        self.buffer_capacity = val;
        self
    }

    /// Sets the name of threads spawned by the dispatcher. The default
    /// names are `weft-coro-{N}` and `weft-io-{N}`.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&'static str, usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker OS threads.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured [`Dispatcher`]. The returned dispatcher has
    /// its worker pools running and is ready to accept submissions.
    pub fn try_build(self) -> Result<Dispatcher> {
        Dispatcher::with_config(self.try_into()?)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolved dispatcher configuration, consumed by the core and its
/// workers.
#[derive(Debug, Clone)]
pub(crate) struct DispatcherConfig {
    pub(crate) num_coro_queues: usize,
    pub(crate) num_io_queues: usize,
    pub(crate) pin_to_cores: bool,
    pub(crate) any_range: (usize, usize),
    pub(crate) load_balance_shared_io: bool,
    pub(crate) shared_io_queue_bound: Option<usize>,
    pub(crate) coro_stack_size: usize,
    pub(crate) buffer_capacity: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
}

impl TryFrom<Builder> for DispatcherConfig {
    type Error = DispatcherError;

    fn try_from(builder: Builder) -> Result<Self> {
        let num_coro_queues = match builder.num_coroutine_threads {
            -1 => thread::available_parallelism().map_or(1, |n| n.get()),
            0 => 1,
            n if n > 0 => n as usize,
            _ => {
                return Err(DispatcherError::InvalidArgument(
                    "num_coroutine_threads must be -1, 0 or positive",
                ));
            }
        };

        let num_io_queues = match builder.num_io_threads {
            n if n <= 0 => 1,
            n => n as usize,
        };

        // Fall back to the full range when the configured one is invalid
        // or empty.
        let mut any_range = (0, num_coro_queues);
        if let Some((lo, hi)) = builder.coro_queue_id_range_for_any {
            if lo < hi && lo < num_coro_queues && hi <= num_coro_queues {
                any_range = (lo, hi);
            }
        }

        Ok(DispatcherConfig {
            num_coro_queues,
            num_io_queues,
            pin_to_cores: builder.pin_coroutine_threads_to_cores,
            any_range,
            load_balance_shared_io: builder.load_balance_shared_io_queues,
            shared_io_queue_bound: builder.shared_io_queue_bound,
            coro_stack_size: builder.coro_stack_size.max(MIN_CORO_STACK_SIZE),
            buffer_capacity: builder.buffer_capacity.max(1),
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
        })
    }
}

/// Parallel execution engine running coroutines and blocking I/O tasks
/// asynchronously. This is the main entry point into the library.
///
/// Construction builds two worker pools: cooperative workers, each bound
/// 1:1 to its own task queue, and I/O workers draining their affine queue
/// plus a shared pool. Dropping the dispatcher terminates both pools and
/// joins every worker; pending work that has not started is failed with
/// `Terminated`.
pub struct Dispatcher {
    core: Arc<DispatcherCore>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    draining: AtomicBool,
    terminated: AtomicBool,
}

impl Dispatcher {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn with_config(cfg: DispatcherConfig) -> Result<Self> {
        let core = DispatcherCore::new(cfg);

        let mut handles = Vec::with_capacity(core.num_coroutine_threads() + core.num_io_threads());
        for queue_id in 0..core.num_coroutine_threads() {
            handles.push(coro_worker::spawn(core.clone(), queue_id));
        }
        for queue_id in 0..core.num_io_threads() {
            handles.push(io_worker::spawn(core.clone(), queue_id));
        }

        debug!(
            coro_threads = core.num_coroutine_threads(),
            io_threads = core.num_io_threads(),
            "dispatcher started"
        );

        Ok(Self {
            core,
            handles: Mutex::new(handles),
            draining: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        })
    }

    fn check_posting(&self) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) || self.core.is_terminated() {
            return Err(DispatcherError::Terminated);
        }
        if self.draining.load(Ordering::Acquire) {
            return Err(DispatcherError::PostingDisabled);
        }
        Ok(())
    }

    // --- Submission ---

    /// Posts a standalone coroutine on any available queue. The returned
    /// context cannot be used to chain further stages.
    pub fn post<T, F>(&self, f: F) -> Result<ThreadContext<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CoroContext<T>) -> anyhow::Result<T> + Send + 'static,
    {
        self.post_on(QueueId::Any, false, f)
    }

    /// Posts a standalone coroutine on a specific queue. A high-priority
    /// submission is scheduled ahead of already queued normal-priority
    /// tasks.
    pub fn post_on<T, F>(
        &self,
        queue_id: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<ThreadContext<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CoroContext<T>) -> anyhow::Result<T> + Send + 'static,
    {
        self.check_posting()?;
        self.core.create_chain(queue_id, high_priority, true, f)
    }

    /// Opens a continuation chain. Nothing runs until `end()` submits the
    /// chain; the returned context chains further stages with `then`,
    /// `on_error` and `finally`.
    pub fn post_first<T, F>(&self, f: F) -> Result<ThreadContext<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CoroContext<T>) -> anyhow::Result<T> + Send + 'static,
    {
        self.post_first_on(QueueId::Any, false, f)
    }

    pub fn post_first_on<T, F>(
        &self,
        queue_id: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<ThreadContext<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CoroContext<T>) -> anyhow::Result<T> + Send + 'static,
    {
        self.check_posting()?;
        self.core.create_chain(queue_id, high_priority, false, f)
    }

    /// Opens a continuation chain whose first stage streams values through
    /// a buffer instead of resolving once: the body `push`es values and
    /// the buffer closes when it returns. Downstream stages consume with
    /// `pull_prev`.
    pub fn post_first_buffered<T, F>(&self, f: F) -> Result<ThreadContext<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CoroContext<T>) -> anyhow::Result<()> + Send + 'static,
    {
        self.post_first_buffered_on(QueueId::Any, false, f)
    }

    pub fn post_first_buffered_on<T, F>(
        &self,
        queue_id: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<ThreadContext<T>>
    where
        T: Send + 'static,
        F: FnOnce(&CoroContext<T>) -> anyhow::Result<()> + Send + 'static,
    {
        self.check_posting()?;
        self.core.create_buffered_chain(queue_id, high_priority, f)
    }

    /// Posts a blocking (or long running) task to the I/O pool. The job is
    /// not wrapped in a coroutine and runs to completion under OS
    /// preemption.
    pub fn post_async_io<T, F>(&self, f: F) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.post_async_io_on(QueueId::Any, false, f)
    }

    /// Posts a blocking task to a specific affine I/O queue.
    pub fn post_async_io_on<T, F>(
        &self,
        queue_id: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<Future<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.check_posting()?;
        self.core.create_io_future(queue_id, high_priority, f)
    }

    // --- Queries ---

    /// Total number of queued tasks for the given scope, including
    /// currently executing ones.
    pub fn size(&self, queue_type: QueueType, queue_id: QueueId) -> Result<usize> {
        self.core.size(queue_type, queue_id)
    }

    pub fn empty(&self, queue_type: QueueType, queue_id: QueueId) -> Result<bool> {
        self.core.empty(queue_type, queue_id)
    }

    /// Aggregated or individual queue statistics for the given scope.
    pub fn stats(&self, queue_type: QueueType, queue_id: QueueId) -> Result<QueueStatistics> {
        self.core.stats(queue_type, queue_id)
    }

    /// Resets all coroutine and I/O queue counters.
    pub fn reset_stats(&self) {
        self.core.reset_stats();
    }

    pub fn num_coroutine_threads(&self) -> usize {
        self.core.num_coroutine_threads()
    }

    pub fn num_io_threads(&self) -> usize {
        self.core.num_io_threads()
    }

    /// The `[lo, hi)` range of cooperative queue ids covered by `Any`.
    pub fn coro_queue_id_range_for_any(&self) -> (usize, usize) {
        self.core.coro_queue_id_range_for_any()
    }

    // --- Lifecycle ---

    /// Blocks until all queues have drained, or until `timeout` elapses
    /// (zero waits indefinitely). Posting from outside is disabled
    /// meanwhile; tasks posted from within an executing coroutine are
    /// still accepted.
    pub fn drain(&self, timeout: Duration) {
        self.draining.store(true, Ordering::Release);
        let start = Instant::now();

        while !self.empty(QueueType::All, QueueId::All).unwrap_or(true) {
            thread::yield_now();
            if !timeout.is_zero() && start.elapsed() > timeout {
                break;
            }
        }

        debug!("all queues have drained");
        self.draining.store(false, Ordering::Release);
    }

    /// Signals all workers to exit after their current task and joins
    /// them. Idempotent and blocking. Queued work that never ran resolves
    /// its promises with `Terminated`.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            self.core.terminate();
            let handles = std::mem::take(&mut *self.handles.lock());
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("coro_threads", &self.num_coroutine_threads())
            .field("io_threads", &self.num_io_threads())
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish()
    }
}
