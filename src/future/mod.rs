mod shared_state;
pub(crate) use shared_state::{SharedState, WakerFn};

pub(crate) mod promise;
pub(crate) use promise::{Promise, PromiseBase};

#[allow(clippy::module_inception)]
mod future;
pub use future::Future;

/// Outcome of a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    Timeout,
}
