//! Error types for ouroboros-future

use std::any::Any;
use thiserror::Error;

/// Result type alias for future and task operations
pub type Result<T> = std::result::Result<T, FutureError>;

/// Errors surfaced by futures, the suspension protocol and the task driver
///
/// None of these are retried internally: they are reported to the nearest
/// caller as soon as they are detected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FutureError {
    /// Operation not valid in the current state (e.g. reading an unresolved
    /// future, resolving a future twice)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A task yielded a future as a plain value instead of awaiting it
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The task was cancelled before it produced a value
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The task's coroutine panicked while being stepped
    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    /// The event loop stopped before the awaited future was resolved
    #[error("Event loop stopped: {0}")]
    LoopStopped(String),
}

impl FutureError {
    /// Returns true if this error is a cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FutureError::Cancelled(_))
    }

    /// Returns true if this error always indicates a bug in the caller
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            FutureError::InvalidState(_) | FutureError::ProtocolViolation(_)
        )
    }
}

/// Extract a readable message from a `catch_unwind` payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FutureError::InvalidState("Future is not done yet".to_string());
        assert_eq!(err.to_string(), "Invalid state: Future is not done yet");

        let err = FutureError::ProtocolViolation("plain yield".to_string());
        assert_eq!(err.to_string(), "Protocol violation: plain yield");
    }

    #[test]
    fn test_error_classification() {
        assert!(FutureError::InvalidState(String::new()).is_programming_error());
        assert!(FutureError::ProtocolViolation(String::new()).is_programming_error());
        assert!(!FutureError::Cancelled(String::new()).is_programming_error());
        assert!(FutureError::Cancelled(String::new()).is_cancelled());
        assert!(!FutureError::LoopStopped(String::new()).is_cancelled());
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
