use std::sync::Arc;

/// Convenience alias for operations that fail with a [`DispatcherError`].
pub type Result<T> = std::result::Result<T, DispatcherError>;

/// A centralized error type for all dispatcher, context and promise operations.
///
/// Every kind except [`DispatcherError::User`] is raised synchronously at the
/// call site. User errors are captured from task bodies and travel through the
/// continuation chain via its stage promises.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DispatcherError {
    /// Queue id outside `[0, N)` and not a permitted sentinel.
    #[error("invalid queue id {id} (valid range [0, {num_queues}))")]
    InvalidQueueId { id: isize, num_queues: usize },

    /// A query or index argument that is structurally wrong, e.g. combining
    /// an aggregate queue type with a specific queue id.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The promise is not in the pending state.
    #[error("promise is not in the pending state")]
    PromiseAlreadySet,

    /// A waiting form was called from the wrong scheduling context, e.g. a
    /// thread-blocking wait from inside a coroutine.
    #[error("operation called from the wrong scheduling context")]
    BadContext,

    /// Structural misuse of a continuation chain: appending after `end()`,
    /// a duplicate `finally`, or chaining off a standalone post.
    #[error("continuation chain is closed")]
    ChainClosed,

    /// The dispatcher or context has been terminated.
    #[error("dispatcher or context has been terminated")]
    Terminated,

    /// Posting from outside the dispatcher is disabled while draining.
    #[error("posting is disabled while draining")]
    PostingDisabled,

    /// A resource could not be allocated, e.g. a coroutine stack.
    #[error("resource allocation failed: {0}")]
    Resource(String),

    /// An error returned (or a panic raised) by a user task body.
    #[error("task error: {0}")]
    User(Arc<anyhow::Error>),
}

impl DispatcherError {
    /// Wraps an error coming out of a user task body. Dispatcher errors that
    /// bubbled through `anyhow` are unwrapped back into their original kind so
    /// that e.g. `Terminated` keeps its meaning across a chain.
    pub fn user(err: anyhow::Error) -> Self {
        match err.downcast::<DispatcherError>() {
            Ok(e) => e,
            Err(err) => Self::User(Arc::new(err)),
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl PartialEq for DispatcherError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::InvalidQueueId { id: a, .. },
                Self::InvalidQueueId { id: b, .. },
            ) => a == b,
            (Self::InvalidArgument(a), Self::InvalidArgument(b)) => a == b,
            (Self::PromiseAlreadySet, Self::PromiseAlreadySet) => true,
            (Self::BadContext, Self::BadContext) => true,
            (Self::ChainClosed, Self::ChainClosed) => true,
            (Self::Terminated, Self::Terminated) => true,
            (Self::PostingDisabled, Self::PostingDisabled) => true,
            (Self::User(a), Self::User(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
