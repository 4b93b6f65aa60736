use crate::context::{CoroSync, current};
use crate::errors::{DispatcherError, Result};
use crate::future::WaitStatus;
use crate::task::SuspendReason;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Callback that re-enqueues a blocked cooperative task once the state it
/// is waiting for becomes observable. Fired at most once, outside the
/// state lock.
pub(crate) type WakerFn = Box<dyn FnOnce() + Send>;

enum Slot<T> {
    Pending,
    Fulfilled(T),
    Failed(DispatcherError),
    Buffer(BufferState<T>),
}

struct BufferState<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
    failed: Option<DispatcherError>,
}

struct Inner<T> {
    slot: Slot<T>,
    /// Consumer-side coroutine wakers, fired on resolution, push and close.
    wakers: SmallVec<[WakerFn; 2]>,
    /// Producer-side coroutine wakers, parked while a bounded buffer is full.
    push_wakers: SmallVec<[WakerFn; 2]>,
}

impl<T> Inner<T> {
    fn is_resolved(&self) -> bool {
        match &self.slot {
            Slot::Pending => false,
            Slot::Fulfilled(_) | Slot::Failed(_) => true,
            Slot::Buffer(buf) => buf.closed || buf.failed.is_some(),
        }
    }

    fn take_wakers(&mut self) -> SmallVec<[WakerFn; 2]> {
        std::mem::take(&mut self.wakers)
    }

    fn take_push_wakers(&mut self) -> SmallVec<[WakerFn; 2]> {
        std::mem::take(&mut self.push_wakers)
    }
}

/// Single-slot, multi-waiter synchronisation cell carrying value-or-error,
/// shared between a `Promise` producer and any number of waiting contexts.
///
/// In buffer mode the cell is a bounded multi-producer / single-consumer
/// stream of values with an explicit close.
///
/// Resolution happens-before any subsequent successful wait: both wait
/// families observe the slot under the same mutex that `set` releases.
pub(crate) struct SharedState<T> {
    inner: Mutex<Inner<T>>,
    resolved: Condvar,
    /// Producer-side condvar for thread pushes into a full buffer.
    space: Condvar,
}

impl<T: Send> SharedState<T> {
    pub(crate) fn new() -> Self {
        Self::with_slot(Slot::Pending)
    }

    pub(crate) fn new_buffer(capacity: usize) -> Self {
        Self::with_slot(Slot::Buffer(BufferState {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            closed: false,
            failed: None,
        }))
    }

    fn with_slot(slot: Slot<T>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slot,
                wakers: SmallVec::new(),
                push_wakers: SmallVec::new(),
            }),
            resolved: Condvar::new(),
            space: Condvar::new(),
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.inner.lock().is_resolved()
    }

    // --- Producer side ---

    /// Pending -> Fulfilled. Fails with `PromiseAlreadySet` on any other
    /// starting state, including buffer mode.
    pub(crate) fn set(&self, value: T) -> Result<()> {
        let wakers = {
            let mut inner = self.inner.lock();
            match inner.slot {
                Slot::Pending => inner.slot = Slot::Fulfilled(value),
                _ => return Err(DispatcherError::PromiseAlreadySet),
            }
            inner.take_wakers()
        };
        self.resolved.notify_all();
        fire(wakers);
        Ok(())
    }

    /// Pending -> Failed. Fails with `PromiseAlreadySet` when already
    /// resolved.
    pub(crate) fn set_exception(&self, err: DispatcherError) -> Result<()> {
        let wakers = {
            let mut inner = self.inner.lock();
            match &mut inner.slot {
                Slot::Pending => inner.slot = Slot::Failed(err),
                Slot::Buffer(buf) if !buf.closed && buf.failed.is_none() => {
                    buf.failed = Some(err);
                }
                _ => return Err(DispatcherError::PromiseAlreadySet),
            }
            let mut wakers = inner.take_wakers();
            wakers.extend(inner.take_push_wakers());
            wakers
        };
        self.resolved.notify_all();
        self.space.notify_all();
        fire(wakers);
        Ok(())
    }

    /// Best-effort failure used when terminating or releasing skipped chain
    /// stages: a no-op if the state is already resolved.
    pub(crate) fn fail(&self, err: DispatcherError) {
        let _ = self.set_exception(err);
    }

    // --- Consumer side, resolved-value access ---

    /// Clones the fulfilled value out. Call after a successful wait.
    pub(crate) fn try_value(&self) -> Result<T>
    where
        T: Clone,
    {
        let inner = self.inner.lock();
        match &inner.slot {
            Slot::Fulfilled(value) => Ok(value.clone()),
            Slot::Failed(err) => Err(err.clone()),
            Slot::Pending => Err(DispatcherError::InvalidArgument(
                "promise is not resolved yet",
            )),
            Slot::Buffer(_) => Err(DispatcherError::InvalidArgument(
                "promise is in buffer mode",
            )),
        }
    }

    /// Borrowed access to the fulfilled value, without cloning.
    pub(crate) fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let inner = self.inner.lock();
        match &inner.slot {
            Slot::Fulfilled(value) => Ok(f(value)),
            Slot::Failed(err) => Err(err.clone()),
            _ => Err(DispatcherError::InvalidArgument(
                "promise is not resolved yet",
            )),
        }
    }

    // --- Thread-waiting family ---

    pub(crate) fn wait(&self) -> Result<()> {
        current::ensure_thread_context()?;
        let mut inner = self.inner.lock();
        while !inner.is_resolved() {
            self.resolved.wait(&mut inner);
        }
        Ok(())
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> Result<WaitStatus> {
        current::ensure_thread_context()?;
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.is_resolved() {
            if self.resolved.wait_until(&mut inner, deadline).timed_out() {
                return Ok(match inner.is_resolved() {
                    true => WaitStatus::Ready,
                    false => WaitStatus::Timeout,
                });
            }
        }
        Ok(WaitStatus::Ready)
    }

    // --- Coroutine-waiting family ---

    /// Parks the running task until resolution. Registers a re-enqueue waker
    /// once, then suspends `Blocked`; the resolving side wakes the task by
    /// putting it back on its queue (edge-triggered), so the loop observes
    /// readiness on its next resumption.
    pub(crate) fn wait_coro(&self, sync: &CoroSync) -> Result<()> {
        sync.validate()?;
        let mut registered = false;
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.is_resolved() {
                    return Ok(());
                }
                if !registered {
                    inner.wakers.push(current::wake_current()?);
                    registered = true;
                }
            }
            sync.suspend(SuspendReason::Blocked);
        }
    }

    /// Timed coroutine wait: samples a monotonic clock across plain yields
    /// instead of parking, so the task stays runnable on its queue.
    pub(crate) fn wait_for_coro(&self, sync: &CoroSync, timeout: Duration) -> Result<WaitStatus> {
        sync.validate()?;
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_resolved() {
                return Ok(WaitStatus::Ready);
            }
            if Instant::now() >= deadline {
                return Ok(WaitStatus::Timeout);
            }
            sync.suspend(SuspendReason::Yielded);
        }
    }

    // --- Buffer mode ---

    /// Appends a value, cooperatively waiting while a bounded buffer is full.
    pub(crate) fn push_coro(&self, sync: &CoroSync, value: T) -> Result<()> {
        sync.validate()?;
        let mut value = Some(value);
        let mut registered = false;
        loop {
            {
                let mut inner = self.inner.lock();
                match self.try_push_locked(&mut inner, &mut value)? {
                    true => return Ok(()),
                    false => {
                        if !registered {
                            inner.push_wakers.push(current::wake_current()?);
                            registered = true;
                        }
                    }
                }
            }
            sync.suspend(SuspendReason::Blocked);
        }
    }

    /// Thread-waiting push, for producers outside the cooperative pool.
    pub(crate) fn push(&self, value: T) -> Result<()> {
        current::ensure_thread_context()?;
        let mut value = Some(value);
        let mut inner = self.inner.lock();
        loop {
            // Re-borrow through the loop: try_push_locked drains wakers.
            match self.try_push_locked(&mut inner, &mut value)? {
                true => return Ok(()),
                false => {
                    self.space.wait(&mut inner);
                }
            }
        }
    }

    /// Attempts the push under the lock; `Ok(false)` means the buffer is
    /// full. On success the consumer is notified after the lock is released
    /// by the caller holding no wakers (push wakes via condvar + wakers
    /// drained here).
    fn try_push_locked(&self, inner: &mut Inner<T>, value: &mut Option<T>) -> Result<bool> {
        let wakers = match &mut inner.slot {
            Slot::Buffer(buf) => {
                if let Some(err) = &buf.failed {
                    return Err(err.clone());
                }
                if buf.closed {
                    return Err(DispatcherError::PromiseAlreadySet);
                }
                if buf.queue.len() >= buf.capacity {
                    return Ok(false);
                }
                let value = value.take().expect("buffer push value consumed twice");
                buf.queue.push_back(value);
                inner.take_wakers()
            }
            _ => {
                return Err(DispatcherError::InvalidArgument(
                    "promise is not in buffer mode",
                ));
            }
        };
        self.resolved.notify_all();
        fire(wakers);
        Ok(true)
    }

    /// Pops the next value, cooperatively waiting while the buffer is empty
    /// and open. Returns `None` once the buffer is closed and drained.
    pub(crate) fn pull_coro(&self, sync: &CoroSync) -> Result<Option<T>> {
        sync.validate()?;
        let mut registered = false;
        loop {
            {
                let mut inner = self.inner.lock();
                match self.try_pull_locked(&mut inner)? {
                    Pulled::Value(v) => return Ok(Some(v)),
                    Pulled::Closed => return Ok(None),
                    Pulled::Empty => {
                        if !registered {
                            inner.wakers.push(current::wake_current()?);
                            registered = true;
                        }
                    }
                }
            }
            sync.suspend(SuspendReason::Blocked);
        }
    }

    /// Thread-waiting pull, for consumers outside the cooperative pool.
    pub(crate) fn pull(&self) -> Result<Option<T>> {
        current::ensure_thread_context()?;
        let mut inner = self.inner.lock();
        loop {
            match self.try_pull_locked(&mut inner)? {
                Pulled::Value(v) => return Ok(Some(v)),
                Pulled::Closed => return Ok(None),
                Pulled::Empty => {
                    self.resolved.wait(&mut inner);
                }
            }
        }
    }

    fn try_pull_locked(&self, inner: &mut Inner<T>) -> Result<Pulled<T>> {
        let value = match &mut inner.slot {
            Slot::Buffer(buf) => {
                if let Some(err) = &buf.failed {
                    return Err(err.clone());
                }
                match buf.queue.pop_front() {
                    Some(value) => value,
                    None if buf.closed => return Ok(Pulled::Closed),
                    None => return Ok(Pulled::Empty),
                }
            }
            _ => {
                return Err(DispatcherError::InvalidArgument(
                    "promise is not in buffer mode",
                ));
            }
        };
        let push_wakers = inner.take_push_wakers();
        self.space.notify_one();
        fire(push_wakers);
        Ok(Pulled::Value(value))
    }

    /// Marks end-of-stream. Idempotent; pending pulls drain the remaining
    /// values and then observe the close.
    pub(crate) fn close_buffer(&self) -> Result<()> {
        let wakers = {
            let mut inner = self.inner.lock();
            match &mut inner.slot {
                Slot::Buffer(buf) => buf.closed = true,
                _ => {
                    return Err(DispatcherError::InvalidArgument(
                        "promise is not in buffer mode",
                    ));
                }
            }
            let mut wakers = inner.take_wakers();
            wakers.extend(inner.take_push_wakers());
            wakers
        };
        self.resolved.notify_all();
        self.space.notify_all();
        fire(wakers);
        Ok(())
    }
}

enum Pulled<T> {
    Value(T),
    Closed,
    Empty,
}

fn fire(wakers: SmallVec<[WakerFn; 2]>) {
    for waker in wakers {
        waker();
    }
}
