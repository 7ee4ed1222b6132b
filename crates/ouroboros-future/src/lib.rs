//! ouroboros-future: single-threaded cooperative futures
//!
//! Provides a future/promise primitive for single-threaded cooperative
//! scheduling, the task type that drives coroutines on top of it, and a
//! small event loop that supplies the scheduling surface.
//!
//! # Architecture
//!
//! A [`Future`] is a write-once value container with completion callbacks.
//! It never runs a callback itself: resolution hands each registered
//! callback to the injected [`Schedule`] implementation, which runs them in
//! registration order on a later iteration.
//!
//! A [`Task`] wraps a Rust `async` body. Awaiting a pending future inside
//! the body suspends the task; the task attaches a continuation to that
//! future, and the continuation re-enqueues the next step once the future is
//! resolved. A body that hands the driver anything other than a suspension
//! request gets a `ProtocolViolation` back at its suspension point.
//!
//! # Usage
//!
//! ```
//! use ouroboros_future::EventLoop;
//!
//! let event_loop = EventLoop::new();
//! let future = event_loop.create_future::<i32>();
//!
//! let producer = future.clone();
//! event_loop.call_soon(Box::new(move || producer.resolve(10).unwrap()));
//!
//! let waiter = future.clone();
//! let value = event_loop.block_on(async move { waiter.await }).unwrap();
//! assert_eq!(value, Ok(10));
//! ```

mod error;
mod event_loop;
mod future;
mod handle;
mod schedule;
mod task;
pub mod config;
pub mod debug;
pub mod exception_handler;
pub mod suspend;

pub use error::{panic_message, FutureError, Result};
pub use event_loop::EventLoop;
pub use future::{Callback, Future, FutureState};
pub use handle::Handle;
pub use schedule::{Job, Schedule, Scheduler};
pub use task::{Task, TaskState};

// Suspension protocol re-exports
pub use suspend::{
    drive, in_step, yield_now, yield_value, Detach, Step, SuspendToken, Wait, Waitable, Yielded,
};

// Ambient re-exports
pub use config::LoopConfig;
pub use debug::{DebugMonitor, LoopStatistics, SlowCallback};
pub use exception_handler::{ExceptionContext, ExceptionHandlerManager};
