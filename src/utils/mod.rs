pub(crate) mod thread;

use crate::errors::DispatcherError;
use std::any::Any;
use std::sync::Arc;

/// Converts a captured panic payload into the error propagated through the
/// panicking task's chain.
pub(crate) fn panic_to_error(panic: Box<dyn Any + Send>) -> DispatcherError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string());
    DispatcherError::User(Arc::new(anyhow::anyhow!("task panicked: {message}")))
}
