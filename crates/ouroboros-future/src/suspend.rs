//! Suspension protocol between a waiting task and its driver
//!
//! A task body is an ordinary `async` block. When it awaits a pending
//! [`Future`], the [`Wait`] step does not poll anything: it hands the driver a
//! [`Yielded::Suspend`] token through the per-step slot installed by
//! [`drive`] and returns `Pending`. The driver attaches a continuation to the
//! awaited future; when the future resolves, the continuation re-enqueues the
//! task and the next poll of `Wait` reads the now-fixed result.
//!
//! ```text
//! task step ──drive()──▶ poll body ──Wait::poll──▶ slot.yielded = Suspend(token)
//!     ◀── Step { yielded } ──────────────────────────────┘
//! driver: token.attach(wakeup)      resolve() ─▶ call_soon(wakeup) ─▶ call_soon(step)
//! ```
//!
//! Yielding a future without awaiting it ([`yield_value`]) produces the
//! distinct [`Yielded::Value`] variant, which the driver answers by throwing
//! a `ProtocolViolation` back into the task at that same point.

use std::cell::RefCell;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{FutureError, Result};
use crate::future::Future;

// ============================================================================
// Driver-facing types
// ============================================================================

/// Type-erased view of something a task can suspend on
pub trait Waitable {
    /// Check if the awaited value is available
    fn is_done(&self) -> bool;

    /// Register `wakeup` to run (through the scheduler) on completion
    ///
    /// The returned [`Detach`] removes the registration again, which a driver
    /// uses when it abandons the wait.
    fn attach(&self, wakeup: Rc<dyn Fn()>) -> Detach;

    /// Short description for logs and error messages
    fn describe(&self) -> String;
}

/// Removes a continuation registered by [`Waitable::attach`]
pub struct Detach {
    remove: Box<dyn FnOnce() -> usize>,
}

impl Detach {
    /// Wrap the removal action
    pub fn new<F>(remove: F) -> Self
    where
        F: FnOnce() -> usize + 'static,
    {
        Self {
            remove: Box::new(remove),
        }
    }

    /// Remove the continuation, returning how many registrations were dropped
    pub fn detach(self) -> usize {
        (self.remove)()
    }
}

impl fmt::Debug for Detach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Detach")
    }
}

/// Marks a future as the thing a task is suspending on
///
/// Only the produce-or-suspend step creates tokens, so receiving one is
/// proof that the task awaited the future rather than yielding it.
pub struct SuspendToken {
    target: Rc<dyn Waitable>,
}

impl SuspendToken {
    pub(crate) fn new(target: Rc<dyn Waitable>) -> Self {
        Self { target }
    }

    /// The awaited future
    pub fn target(&self) -> &dyn Waitable {
        self.target.as_ref()
    }

    /// Consume the token and register the driver's continuation
    pub fn attach(self, wakeup: Rc<dyn Fn()>) -> Detach {
        self.target.attach(wakeup)
    }
}

impl fmt::Debug for SuspendToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SuspendToken({})", self.target.describe())
    }
}

/// What a task handed its driver during one step
pub enum Yielded {
    /// The task is waiting on the token's future
    Suspend(SuspendToken),
    /// The task yielded a future as a plain value (wrong form)
    Value(Rc<dyn Waitable>),
    /// The task gave up control without waiting on anything
    Bare,
}

impl fmt::Debug for Yielded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Yielded::Suspend(token) => write!(f, "Suspend({:?})", token),
            Yielded::Value(value) => write!(f, "Value({})", value.describe()),
            Yielded::Bare => f.write_str("Bare"),
        }
    }
}

/// Outcome of one [`drive`] call
#[derive(Debug)]
pub struct Step<R> {
    /// Whatever the poll closure returned
    pub output: R,
    /// What the task handed over, if anything
    pub yielded: Option<Yielded>,
    /// A thrown error no suspension point picked up
    pub unclaimed: Option<FutureError>,
}

// ============================================================================
// Per-step slot
// ============================================================================

#[derive(Default)]
struct StepSlot {
    thrown: Option<FutureError>,
    yielded: Option<Yielded>,
}

thread_local! {
    static CURRENT_STEP: RefCell<Option<StepSlot>> = const { RefCell::new(None) };
}

/// Puts the enclosing step's slot back even if the poll panics
struct RestoreSlot(Option<StepSlot>);

impl Drop for RestoreSlot {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT_STEP.with(|current| *current.borrow_mut() = previous);
    }
}

/// Run one step of a task
///
/// Installs a fresh slot carrying `thrown`, runs `poll`, and returns what
/// the task yielded. Any slot that was active before is restored afterwards.
///
/// `thrown` goes to the first suspension point polled during this step. In
/// a body that awaits one thing at a time that is the point which yielded
/// last. A combinator polling several branches hands it to whichever branch
/// it polls first, which need not be the branch that caused it.
pub fn drive<R, F>(thrown: Option<FutureError>, poll: F) -> Step<R>
where
    F: FnOnce() -> R,
{
    let previous = CURRENT_STEP.with(|current| {
        current.borrow_mut().replace(StepSlot {
            thrown,
            yielded: None,
        })
    });
    let restore = RestoreSlot(previous);

    let output = poll();

    let slot = CURRENT_STEP
        .with(|current| current.borrow_mut().take())
        .unwrap_or_default();
    drop(restore);

    Step {
        output,
        yielded: slot.yielded,
        unclaimed: slot.thrown,
    }
}

/// Check if the current thread is inside a [`drive`] call
pub fn in_step() -> bool {
    CURRENT_STEP.with(|current| current.borrow().is_some())
}

/// First caller in the step wins; the error carries no yield site
fn take_thrown() -> Option<FutureError> {
    CURRENT_STEP.with(|current| {
        current
            .borrow_mut()
            .as_mut()
            .and_then(|slot| slot.thrown.take())
    })
}

enum Handoff {
    Accepted,
    NoDriver,
    Occupied,
}

fn hand_to_driver(yielded: Yielded) -> Handoff {
    CURRENT_STEP.with(|current| {
        let mut current = current.borrow_mut();
        let Some(slot) = current.as_mut() else {
            return Handoff::NoDriver;
        };
        let incoming_bare = matches!(yielded, Yielded::Bare);
        match slot.yielded {
            None | Some(Yielded::Bare) => {
                slot.yielded = Some(yielded);
                Handoff::Accepted
            }
            // a bare yield adds nothing to a pending suspension
            Some(_) if incoming_bare => Handoff::Accepted,
            Some(_) => Handoff::Occupied,
        }
    })
}

fn one_suspension_per_step() -> FutureError {
    FutureError::ProtocolViolation(
        "a task can suspend on only one future per step".to_string(),
    )
}

// ============================================================================
// Caller-side steps
// ============================================================================

/// Produce-or-suspend step returned by awaiting a [`Future`]
///
/// Resolves immediately when the future is already done. Otherwise it
/// suspends the task exactly once; when the task is resumed the future must
/// be resolved.
#[must_use = "futures do nothing unless awaited"]
pub struct Wait<T> {
    future: Future<T>,
    suspended: bool,
}

impl<T> Wait<T> {
    pub(crate) fn new(future: Future<T>) -> Self {
        Self {
            future,
            suspended: false,
        }
    }
}

impl<T: Clone + 'static> std::future::Future for Wait<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(err) = take_thrown() {
            return Poll::Ready(Err(err));
        }

        if self.future.is_done() {
            return Poll::Ready(self.future.result());
        }

        if self.suspended {
            return Poll::Ready(Err(FutureError::InvalidState(
                "task resumed before the awaited future was resolved".to_string(),
            )));
        }

        let token = SuspendToken::new(Rc::new(self.future.clone()));
        match hand_to_driver(Yielded::Suspend(token)) {
            Handoff::Accepted => {
                self.suspended = true;
                Poll::Pending
            }
            Handoff::NoDriver => Poll::Ready(Err(FutureError::InvalidState(
                "Future awaited outside of a running task".to_string(),
            ))),
            Handoff::Occupied => Poll::Ready(Err(one_suspension_per_step())),
        }
    }
}

/// Yield `future` to the driver as a plain value instead of awaiting it
///
/// This is the wrong suspension form. A conforming driver refuses it by
/// throwing `ProtocolViolation` back, which this step then returns unless
/// another suspension point is polled before it on the next step (see
/// [`drive`]).
pub fn yield_value<T: 'static>(future: &Future<T>) -> Produce {
    let value: Rc<dyn Waitable> = Rc::new(future.clone());
    Produce { value: Some(value) }
}

/// Step returned by [`yield_value`]
#[must_use = "futures do nothing unless awaited"]
pub struct Produce {
    value: Option<Rc<dyn Waitable>>,
}

impl std::future::Future for Produce {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(err) = take_thrown() {
            return Poll::Ready(Err(err));
        }

        let Some(value) = self.value.take() else {
            return Poll::Ready(Ok(()));
        };

        match hand_to_driver(Yielded::Value(value)) {
            Handoff::Accepted => Poll::Pending,
            Handoff::NoDriver => Poll::Ready(Err(FutureError::InvalidState(
                "value yielded outside of a running task".to_string(),
            ))),
            Handoff::Occupied => Poll::Ready(Err(one_suspension_per_step())),
        }
    }
}

/// Give control back to the driver once without waiting on anything
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Step returned by [`yield_now`]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl std::future::Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }

        match hand_to_driver(Yielded::Bare) {
            Handoff::Accepted => {
                self.yielded = true;
                Poll::Pending
            }
            Handoff::NoDriver | Handoff::Occupied => Poll::Ready(()),
        }
    }
}
