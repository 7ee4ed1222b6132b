//! Handle type for scheduled callbacks
//!
//! A Handle represents a job handed to the scheduling surface that can be
//! cancelled before it runs. It's returned by `Schedule::call_soon`.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Handle to a scheduled callback
///
/// Clones share the same cancellation flag, so the scheduler can keep one
/// copy next to the queued job while the caller keeps another.
///
/// # Example
///
/// ```
/// use ouroboros_future::EventLoop;
///
/// let event_loop = EventLoop::new();
/// let handle = event_loop.call_soon(Box::new(|| println!("never printed")));
/// handle.cancel();
/// assert_eq!(event_loop.run_once(), 0);
/// ```
#[derive(Clone, Default)]
pub struct Handle {
    cancelled: Rc<Cell<bool>>,
}

impl Handle {
    /// Create a new Handle with a fresh cancellation flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle that is already cancelled
    ///
    /// Returned when a job could not be scheduled at all.
    pub fn cancelled() -> Self {
        let handle = Self::new();
        handle.cancel();
        handle
    }

    /// Cancel the callback
    ///
    /// If the callback has not yet been executed, it will be skipped.
    /// Calling cancel() on an already-executed or already-cancelled handle
    /// has no effect.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// Check if the callback has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(cancelled={})", self.is_cancelled())
    }
}
