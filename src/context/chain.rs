use crate::dispatcher::core::DispatcherCore;
use crate::errors::{DispatcherError, Result};
use crate::future::{Promise, PromiseBase, SharedState};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// State shared by every stage of one continuation chain.
///
/// Holds the ordered promise sequence, one promise per stage, indexed
/// 0-based from the first stage. All stage façades (`ThreadContext`,
/// `CoroContext`) observe the same sequence; each stage reads earlier
/// stages by index.
pub(crate) struct ChainState {
    /// Non-owning handle back to the dispatcher; chains never extend its
    /// lifetime.
    core: Weak<DispatcherCore>,
    promises: RwLock<Vec<Arc<dyn PromiseBase>>>,
    /// Set by `end()` (or immediately for standalone posts); no stages may
    /// be appended afterwards.
    sealed: AtomicBool,
    has_final: AtomicBool,
    terminated: AtomicBool,
}

impl ChainState {
    pub(crate) fn new(core: Weak<DispatcherCore>) -> Arc<Self> {
        Arc::new(Self {
            core,
            promises: RwLock::new(Vec::new()),
            sealed: AtomicBool::new(false),
            has_final: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        })
    }

    pub(crate) fn core(&self) -> Result<Arc<DispatcherCore>> {
        self.core.upgrade().ok_or(DispatcherError::Terminated)
    }

    /// Appends a stage promise, returning its stage index.
    pub(crate) fn push_promise(&self, promise: Arc<dyn PromiseBase>) -> usize {
        let mut promises = self.promises.write();
        // A promise appended while the chain is being torn down must not
        // miss the failure sweep.
        if self.terminated.load(Ordering::Acquire) {
            promise.fail(DispatcherError::Terminated);
        }
        promises.push(promise);
        promises.len() - 1
    }

    pub(crate) fn len(&self) -> usize {
        self.promises.read().len()
    }

    pub(crate) fn promise_at(&self, index: usize) -> Result<Arc<dyn PromiseBase>> {
        self.promises
            .read()
            .get(index)
            .cloned()
            .ok_or(DispatcherError::InvalidArgument("stage index out of range"))
    }

    /// Typed view of a stage promise; the caller names the stage's value
    /// type, exactly as it was submitted.
    pub(crate) fn typed_promise<T: Send + 'static>(&self, index: usize) -> Result<Promise<T>> {
        let promise = self.promise_at(index)?;
        promise
            .as_any()
            .downcast_ref::<Promise<T>>()
            .cloned()
            .ok_or(DispatcherError::InvalidArgument(
                "stage value type mismatch",
            ))
    }

    pub(crate) fn typed_state<T: Send + 'static>(&self, index: usize) -> Result<Arc<SharedState<T>>> {
        Ok(self.typed_promise::<T>(index)?.state().clone())
    }

    /// Maps a possibly-negative stage index to an absolute one. Negative
    /// indices are relative to `from_stage`: -1 is the previous stage.
    pub(crate) fn index(&self, from_stage: usize, num: i32) -> Result<usize> {
        let len = self.len() as i64;
        let index = match num < 0 {
            true => from_stage as i64 + num as i64,
            false => num as i64,
        };
        if index < 0 || index >= len {
            return Err(DispatcherError::InvalidArgument("stage index out of range"));
        }
        Ok(index as usize)
    }

    pub(crate) fn fail_stage(&self, index: usize, err: DispatcherError) {
        if let Some(promise) = self.promises.read().get(index) {
            promise.fail(err);
        }
    }

    /// Fails every unresolved promise in the chain and refuses new stages.
    /// Idempotent; a running stage body is not interrupted.
    pub(crate) fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            for promise in self.promises.read().iter() {
                promise.fail(DispatcherError::Terminated);
            }
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Claims the chain's single `finally` slot.
    pub(crate) fn try_set_final(&self) -> Result<()> {
        match self.has_final.swap(true, Ordering::AcqRel) {
            true => Err(DispatcherError::ChainClosed),
            false => Ok(()),
        }
    }

    pub(crate) fn has_final(&self) -> bool {
        self.has_final.load(Ordering::Acquire)
    }
}
