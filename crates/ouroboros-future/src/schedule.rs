//! Scheduling surface consumed by futures and tasks
//!
//! The core never runs a callback itself. It hands zero-argument jobs to a
//! [`Schedule`] implementation, which runs them later, in FIFO order, from
//! its own run loop. [`EventLoop`](crate::EventLoop) is the in-crate
//! implementation; tests can substitute any recording scheduler.

use std::rc::Rc;

use crate::handle::Handle;

/// A unit of deferred work. Arguments are captured by the closure.
pub type Job = Box<dyn FnOnce()>;

/// Shared reference to a scheduling surface, injected into every future
pub type Scheduler = Rc<dyn Schedule>;

/// Enqueue-for-later capability
pub trait Schedule {
    /// Arrange for `job` to run on a later iteration of the scheduler.
    ///
    /// Implementations must never run `job` before returning. Jobs from the
    /// same scheduler run in the order they were enqueued.
    fn call_soon(&self, job: Job) -> Handle;
}
