//! Future: single-assignment result container with deferred callbacks
//!
//! A [`Future`] starts pending, is resolved exactly once, and notifies the
//! callbacks registered on it through the scheduling surface it was built
//! with. Callbacks never run inside `resolve` or `add_callback`; they are
//! always handed to [`Schedule::call_soon`](crate::Schedule::call_soon).

use std::cell::RefCell;
use std::fmt;
use std::future::IntoFuture;
use std::rc::Rc;

use crate::error::{FutureError, Result};
use crate::schedule::Scheduler;
use crate::suspend::{Detach, Wait, Waitable};

/// Resolution state of a [`Future`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    /// No value yet; callbacks are queued
    Pending,
    /// Value fixed; never changes again
    Resolved,
}

/// Completion callback registered on a [`Future`]
///
/// Equality is identity: two `Callback`s are equal when they are clones of
/// the same registration, which is what [`Future::remove_callback`] matches on.
pub struct Callback<T> {
    func: Rc<dyn Fn(&Future<T>)>,
}

impl<T> Callback<T> {
    /// Wrap a closure that receives the resolved future
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Future<T>) + 'static,
    {
        Self {
            func: Rc::new(func),
        }
    }

    fn invoke(&self, future: &Future<T>) {
        (self.func)(future)
    }
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        Self {
            func: Rc::clone(&self.func),
        }
    }
}

impl<T> PartialEq for Callback<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.func, &other.func)
    }
}

impl<T> Eq for Callback<T> {}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Rc::as_ptr(&self.func) as *const ())
    }
}

enum Slot<T> {
    Pending { callbacks: Vec<Callback<T>> },
    Resolved(T),
}

struct Shared<T> {
    slot: RefCell<Slot<T>>,
    scheduler: Scheduler,
}

/// Shared handle to a single-assignment value
///
/// Cloning is cheap and every clone observes the same state. Any holder may
/// read or observe the future; exactly one of them should resolve it, which
/// is enforced by `resolve` failing on the second call.
///
/// # Example
///
/// ```
/// use ouroboros_future::EventLoop;
///
/// let event_loop = EventLoop::new();
/// let future = event_loop.create_future::<u32>();
///
/// future.add_done_callback(|f| println!("resolved with {:?}", f.result()));
/// future.resolve(10).unwrap();
///
/// assert!(future.is_done());
/// assert_eq!(future.result().unwrap(), 10);
/// assert!(future.resolve(11).is_err());
/// ```
pub struct Future<T> {
    shared: Rc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: 'static> Future<T> {
    /// Create a pending future that schedules its callbacks on `scheduler`
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            shared: Rc::new(Shared {
                slot: RefCell::new(Slot::Pending {
                    callbacks: Vec::new(),
                }),
                scheduler,
            }),
        }
    }

    /// Current resolution state
    pub fn state(&self) -> FutureState {
        match &*self.shared.slot.borrow() {
            Slot::Pending { .. } => FutureState::Pending,
            Slot::Resolved(_) => FutureState::Resolved,
        }
    }

    /// Check if the future has been resolved
    pub fn is_done(&self) -> bool {
        self.state() == FutureState::Resolved
    }

    /// Get the resolved value
    ///
    /// Returns `InvalidState` while the future is pending. Once resolved,
    /// every call returns a clone of the same value.
    pub fn result(&self) -> Result<T>
    where
        T: Clone,
    {
        match &*self.shared.slot.borrow() {
            Slot::Resolved(value) => Ok(value.clone()),
            Slot::Pending { .. } => Err(FutureError::InvalidState(
                "Future is not done yet".to_string(),
            )),
        }
    }

    /// Apply `func` to the resolved value without cloning it
    ///
    /// Returns `None` while the future is pending. `func` runs while the
    /// value is borrowed, so it must not resolve this future.
    pub fn inspect<R>(&self, func: impl FnOnce(&T) -> R) -> Option<R> {
        match &*self.shared.slot.borrow() {
            Slot::Resolved(value) => Some(func(value)),
            Slot::Pending { .. } => None,
        }
    }

    /// Resolve the future with `value`
    ///
    /// Stores the value, then schedules every registered callback in
    /// registration order and clears the list. A second call fails with
    /// `InvalidState` and leaves the first value in place.
    pub fn resolve(&self, value: T) -> Result<()> {
        let callbacks = {
            let mut slot = self.shared.slot.borrow_mut();
            let callbacks = match &mut *slot {
                Slot::Resolved(_) => {
                    return Err(FutureError::InvalidState(
                        "Future is already resolved".to_string(),
                    ))
                }
                Slot::Pending { callbacks } => std::mem::take(callbacks),
            };
            *slot = Slot::Resolved(value);
            callbacks
        };

        tracing::trace!(callbacks = callbacks.len(), "Future resolved");

        for callback in callbacks {
            self.schedule_callback(callback);
        }
        Ok(())
    }

    /// Register `callback` to run once the future is resolved
    ///
    /// On a pending future the callback is queued behind earlier
    /// registrations. On a resolved future it is scheduled right away, but
    /// still never invoked before this call returns.
    pub fn add_callback(&self, callback: Callback<T>) {
        {
            let mut slot = self.shared.slot.borrow_mut();
            if let Slot::Pending { callbacks } = &mut *slot {
                callbacks.push(callback);
                return;
            }
        }
        self.schedule_callback(callback);
    }

    /// Wrap `func` in a [`Callback`], register it and return it
    ///
    /// Keep the returned value to remove the registration later.
    pub fn add_done_callback<F>(&self, func: F) -> Callback<T>
    where
        F: Fn(&Future<T>) + 'static,
    {
        let callback = Callback::new(func);
        self.add_callback(callback.clone());
        callback
    }

    /// Remove every pending registration of `callback`
    ///
    /// Returns the number of entries removed; 0 when the callback was never
    /// registered or the future is already resolved.
    pub fn remove_callback(&self, callback: &Callback<T>) -> usize {
        let mut slot = self.shared.slot.borrow_mut();
        match &mut *slot {
            Slot::Pending { callbacks } => {
                let before = callbacks.len();
                callbacks.retain(|registered| registered != callback);
                before - callbacks.len()
            }
            Slot::Resolved(_) => 0,
        }
    }

    /// Number of callbacks waiting for resolution
    pub fn callback_count(&self) -> usize {
        match &*self.shared.slot.borrow() {
            Slot::Pending { callbacks } => callbacks.len(),
            Slot::Resolved(_) => 0,
        }
    }

    /// The scheduling surface this future reports to
    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// Check if both handles refer to the same future
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    /// Produce-or-suspend step for use inside a task
    ///
    /// Equivalent to `future.clone().await`.
    pub fn wait(&self) -> Wait<T>
    where
        T: Clone,
    {
        Wait::new(self.clone())
    }

    fn schedule_callback(&self, callback: Callback<T>) {
        let future = self.clone();
        self.shared
            .scheduler
            .call_soon(Box::new(move || callback.invoke(&future)));
    }
}

impl<T: Clone + 'static> IntoFuture for Future<T> {
    type Output = Result<T>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Self::IntoFuture {
        Wait::new(self)
    }
}

impl<T: 'static> Waitable for Future<T> {
    fn is_done(&self) -> bool {
        Future::is_done(self)
    }

    fn attach(&self, wakeup: Rc<dyn Fn()>) -> Detach {
        let callback = self.add_done_callback(move |_| wakeup());
        let future = self.clone();
        Detach::new(move || future.remove_callback(&callback))
    }

    fn describe(&self) -> String {
        format!("{:?}", self)
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.slot.try_borrow() {
            Ok(slot) => match &*slot {
                Slot::Pending { callbacks } => {
                    write!(f, "Future(pending, callbacks={})", callbacks.len())
                }
                Slot::Resolved(_) => write!(f, "Future(resolved)"),
            },
            Err(_) => write!(f, "Future(<borrowed>)"),
        }
    }
}
