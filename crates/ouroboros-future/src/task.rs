//! Task driver for cooperative coroutines
//!
//! A Task owns an `async` body and steps it through the scheduling surface.
//! It never polls a pending body speculatively: after a step that suspended
//! on a [`Future`], the only way back in is the continuation registered on
//! that future, which re-enqueues the next step.

use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{panic_message, FutureError, Result};
use crate::future::Future;
use crate::schedule::Scheduler;
use crate::suspend::{self, Detach, SuspendToken, Yielded};

thread_local! {
    static NEXT_TASK_ID: Cell<u64> = const { Cell::new(1) };
}

/// Next id for a task created on this thread
fn next_task_id() -> u64 {
    NEXT_TASK_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    })
}

/// Lifecycle of a [`Task`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// A step is queued on the scheduler
    Scheduled,
    /// The body is being polled
    Running,
    /// Waiting for an awaited future to resolve
    Suspended,
    /// The body returned or panicked
    Done,
    /// Cancelled before the body returned
    Cancelled,
}

impl TaskState {
    /// Check if this is a terminal state
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }
}

struct TaskCore<T> {
    id: u64,
    name: Option<String>,
    body: RefCell<Option<LocalBoxFuture<'static, T>>>,
    state: Cell<TaskState>,
    /// Error to deliver at the body's current suspension point
    thrown: RefCell<Option<FutureError>>,
    /// Continuation registered on the awaited future while suspended
    waiting: RefCell<Option<Detach>>,
    outcome: Future<Result<T>>,
    scheduler: Scheduler,
}

impl<T: 'static> TaskCore<T> {
    fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("'{}'", name),
            None => format!("#{}", self.id),
        }
    }

    fn schedule_step(self: &Rc<Self>) {
        let core = Rc::clone(self);
        self.scheduler.call_soon(Box::new(move || core.step()));
    }

    fn reschedule(self: &Rc<Self>) {
        self.state.set(TaskState::Scheduled);
        self.schedule_step();
    }

    fn step(self: &Rc<Self>) {
        let state = self.state.get();
        if state != TaskState::Scheduled {
            tracing::trace!(task_id = self.id, state = state.as_str(), "Ignoring stale task step");
            return;
        }

        self.state.set(TaskState::Running);
        let thrown = self.thrown.borrow_mut().take();

        let polled = {
            let mut body = self.body.borrow_mut();
            let Some(body) = body.as_mut() else {
                return;
            };
            let mut cx = Context::from_waker(noop_waker_ref());
            catch_unwind(AssertUnwindSafe(|| {
                suspend::drive(thrown, || body.as_mut().poll(&mut cx))
            }))
        };

        // cancelled from inside its own body
        if self.state.get() == TaskState::Cancelled {
            let body = self.body.borrow_mut().take();
            drop(body);
            return;
        }

        let step = match polled {
            Ok(step) => step,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(task_id = self.id, panic = %message, "Task body panicked");
                self.finish(Err(FutureError::TaskPanicked(message)));
                return;
            }
        };

        let suspend::Step { output, yielded, unclaimed } = step;
        if let Poll::Ready(value) = output {
            if let Some(err) = unclaimed {
                tracing::warn!(task_id = self.id, error = %err, "Thrown error was not claimed by the task");
            }
            self.finish(Ok(value));
            return;
        }

        // still pending after ignoring the thrown error, so nothing can resume it
        if let Some(err) = unclaimed {
            tracing::warn!(task_id = self.id, error = %err, "Thrown error was not claimed; ending task");
            self.finish(Err(err));
            return;
        }

        match yielded {
            Some(Yielded::Suspend(token)) => self.suspend_on(token),
            Some(Yielded::Value(value)) => {
                let err = FutureError::ProtocolViolation(format!(
                    "task {} yielded {} as a plain value; await it instead",
                    self.label(),
                    value.describe()
                ));
                self.throw(err);
            }
            Some(Yielded::Bare) => self.reschedule(),
            None => {
                let err = FutureError::ProtocolViolation(format!(
                    "task {} body returned Pending without suspending on a Future",
                    self.label()
                ));
                self.throw(err);
            }
        }
    }

    /// Deliver `err` at the suspension point polled on the next step
    fn throw(self: &Rc<Self>, err: FutureError) {
        tracing::warn!(task_id = self.id, error = %err, "Wrong suspension form");
        *self.thrown.borrow_mut() = Some(err);
        self.reschedule();
    }

    fn suspend_on(self: &Rc<Self>, token: SuspendToken) {
        tracing::trace!(task_id = self.id, awaiting = ?token, "Task suspended");
        self.state.set(TaskState::Suspended);
        // the awaited future only holds the task weakly
        let core = Rc::downgrade(self);
        let detach = token.attach(Rc::new(move || match core.upgrade() {
            Some(core) => core.wakeup(),
            None => tracing::trace!("Continuation fired for a dropped task"),
        }));
        *self.waiting.borrow_mut() = Some(detach);
    }

    /// Continuation body: re-enqueue the suspended task
    fn wakeup(self: &Rc<Self>) {
        if self.state.get() != TaskState::Suspended {
            tracing::trace!(task_id = self.id, "No-op resumption of a task that is not waiting");
            return;
        }
        self.waiting.borrow_mut().take();
        self.reschedule();
    }

    fn finish(&self, result: Result<T>) {
        let body = self.body.borrow_mut().take();
        drop(body);
        self.state.set(TaskState::Done);
        tracing::debug!(task_id = self.id, ok = result.is_ok(), "Task finished");
        if let Err(err) = self.outcome.resolve(result) {
            tracing::error!(task_id = self.id, error = %err, "Task outcome was already set");
        }
    }

    fn cancel(&self) -> bool {
        if self.state.get().is_finished() {
            return false;
        }

        let waiting = self.waiting.borrow_mut().take();
        if let Some(detach) = waiting {
            let removed = detach.detach();
            tracing::debug!(task_id = self.id, removed, "Detached continuation from awaited future");
        }

        self.state.set(TaskState::Cancelled);
        self.thrown.borrow_mut().take();

        // still borrowed when the body cancels itself; `step` drops it then
        let body = self.body.try_borrow_mut().ok().and_then(|mut body| body.take());
        drop(body);

        let err = FutureError::Cancelled(format!("Task {} was cancelled", self.label()));
        if let Err(err) = self.outcome.resolve(Err(err)) {
            tracing::error!(task_id = self.id, error = %err, "Task outcome was already set");
        }
        tracing::debug!(task_id = self.id, "Task cancelled");
        true
    }
}

/// Handle to a coroutine driven by the scheduling surface
///
/// Clones refer to the same task.
///
/// # Example
///
/// ```
/// use ouroboros_future::EventLoop;
///
/// let event_loop = EventLoop::new();
/// let future = event_loop.create_future::<u32>();
///
/// let waiter = future.clone();
/// let task = event_loop.spawn(async move { waiter.await.map(|v| v * 2) });
///
/// let producer = future.clone();
/// event_loop.call_soon(Box::new(move || producer.resolve(21).unwrap()));
///
/// assert_eq!(event_loop.run_until_complete(task.future()).unwrap(), Ok(Ok(42)));
/// ```
pub struct Task<T> {
    core: Rc<TaskCore<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: 'static> Task<T> {
    /// Wrap `body` in a task and schedule its first step
    ///
    /// The body never starts running before this call returns.
    pub fn new<F>(body: F, scheduler: Scheduler, name: Option<String>) -> Self
    where
        F: std::future::Future<Output = T> + 'static,
    {
        let core = Rc::new(TaskCore {
            id: next_task_id(),
            name,
            body: RefCell::new(Some(body.boxed_local())),
            state: Cell::new(TaskState::Scheduled),
            thrown: RefCell::new(None),
            waiting: RefCell::new(None),
            outcome: Future::new(Rc::clone(&scheduler)),
            scheduler,
        });

        tracing::debug!(task_id = core.id, name = ?core.name, "Task created");
        core.schedule_step();
        Self { core }
    }

    /// Unique task id
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Optional task name
    pub fn name(&self) -> Option<&str> {
        self.core.name.as_deref()
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.core.state.get()
    }

    /// Check if the task has finished, successfully or not
    pub fn is_done(&self) -> bool {
        self.core.outcome.is_done()
    }

    /// Check if the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Cancel the task
    ///
    /// Detaches the continuation from the awaited future, drops the body and
    /// resolves the task's future with `Cancelled`. Returns false if the task
    /// had already finished. Steps or wakeups already queued become no-ops.
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    /// Future resolved with the body's output once the task finishes
    pub fn future(&self) -> &Future<Result<T>> {
        &self.core.outcome
    }

    /// Get the task result
    ///
    /// `InvalidState` while the task is running; otherwise the body's output
    /// or the error that ended it.
    pub fn result(&self) -> Result<T>
    where
        T: Clone,
    {
        self.core.outcome.result()?
    }

    /// Await the task from another task
    pub fn join(&self) -> impl std::future::Future<Output = Result<T>> + 'static
    where
        T: Clone,
    {
        let outcome = self.core.outcome.clone();
        async move { outcome.await? }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.get().as_str();
        match &self.core.name {
            Some(name) => write!(f, "Task(name='{}', state={})", name, state),
            None => write!(f, "Task(id={}, state={})", self.core.id, state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::suspend::{yield_now, yield_value};

    #[test]
    fn test_task_does_not_start_synchronously() {
        let event_loop = EventLoop::new();
        let started = Rc::new(Cell::new(false));

        let started_clone = Rc::clone(&started);
        let task = event_loop.spawn(async move {
            started_clone.set(true);
            7
        });

        assert!(!started.get(), "Body must not run inside spawn");
        assert_eq!(task.state(), TaskState::Scheduled);
        assert!(!task.is_done());
        assert!(matches!(task.result(), Err(FutureError::InvalidState(_))));

        event_loop.run_until_idle().unwrap();
        assert!(started.get());
        assert_eq!(task.state(), TaskState::Done);
        assert_eq!(task.result().unwrap(), 7);
    }

    #[test]
    fn test_task_suspends_until_future_resolves() {
        let event_loop = EventLoop::new();
        let future = event_loop.create_future::<i32>();

        let waiter = future.clone();
        let task = event_loop.spawn(async move { waiter.await });

        event_loop.run_until_idle().unwrap();
        assert_eq!(task.state(), TaskState::Suspended);
        assert_eq!(future.callback_count(), 1, "Continuation is registered on the future");

        future.resolve(10).unwrap();
        event_loop.run_until_idle().unwrap();
        assert_eq!(task.state(), TaskState::Done);
        assert_eq!(task.result().unwrap(), Ok(10));
    }

    #[test]
    fn test_cancel_detaches_continuation() {
        let event_loop = EventLoop::new();
        let future = event_loop.create_future::<i32>();
        let resumed = Rc::new(Cell::new(false));

        let waiter = future.clone();
        let resumed_clone = Rc::clone(&resumed);
        let task = event_loop.spawn(async move {
            let value = waiter.await;
            resumed_clone.set(true);
            value
        });

        event_loop.run_until_idle().unwrap();
        assert_eq!(future.callback_count(), 1);

        assert!(task.cancel(), "Suspended task can be cancelled");
        assert_eq!(future.callback_count(), 0, "Continuation removed on cancel");
        assert!(task.is_cancelled());
        assert!(matches!(task.result(), Err(FutureError::Cancelled(_))));

        future.resolve(1).unwrap();
        event_loop.run_until_idle().unwrap();
        assert!(!resumed.get(), "Cancelled task must not resume");
        assert!(!task.cancel(), "Second cancel reports false");
    }

    #[test]
    fn test_cancel_racing_with_resolution_is_noop() {
        let event_loop = EventLoop::new();
        let future = event_loop.create_future::<i32>();
        let resumed = Rc::new(Cell::new(false));

        let waiter = future.clone();
        let resumed_clone = Rc::clone(&resumed);
        let task = event_loop.spawn(async move {
            let value = waiter.await;
            resumed_clone.set(true);
            value
        });
        event_loop.run_until_idle().unwrap();

        // continuation is already queued when the cancel arrives
        future.resolve(1).unwrap();
        assert_eq!(event_loop.pending_callbacks(), 1);
        assert!(task.cancel());

        event_loop.run_until_idle().unwrap();
        assert!(!resumed.get(), "Queued wakeup is a no-op after cancel");
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_task_cancelling_itself() {
        let event_loop = EventLoop::new();
        let slot: Rc<RefCell<Option<Task<i32>>>> = Rc::new(RefCell::new(None));
        let after_cancel = Rc::new(Cell::new(false));

        let slot_clone = Rc::clone(&slot);
        let after_clone = Rc::clone(&after_cancel);
        let task = event_loop.spawn(async move {
            let me = slot_clone.borrow().clone();
            if let Some(me) = me {
                assert!(me.cancel());
            }
            yield_now().await;
            after_clone.set(true);
            1
        });
        *slot.borrow_mut() = Some(task.clone());

        event_loop.run_until_idle().unwrap();
        assert!(task.is_cancelled());
        assert!(!after_cancel.get(), "Body is dropped at its next suspension");
        slot.borrow_mut().take();
    }

    #[test]
    fn test_panicking_body_resolves_with_error() {
        let event_loop = EventLoop::new();
        let task = event_loop.spawn(async {
            if true {
                panic!("body failed");
            }
            0
        });

        event_loop.run_until_idle().unwrap();
        match task.result() {
            Err(FutureError::TaskPanicked(message)) => assert_eq!(message, "body failed"),
            other => panic!("Expected TaskPanicked, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_yield_raises_protocol_violation_in_task() {
        let event_loop = EventLoop::new();
        let future = event_loop.create_future::<i32>();

        let yielded = future.clone();
        let task = event_loop.spawn(async move {
            match yield_value(&yielded).await {
                Err(FutureError::ProtocolViolation(_)) => "caught",
                Err(_) => "other error",
                Ok(()) => "resumed normally",
            }
        });

        event_loop.run_until_idle().unwrap();
        assert_eq!(task.result().unwrap(), "caught");
        assert_eq!(future.callback_count(), 0, "Plain yields never register a continuation");
    }

    #[test]
    fn test_pending_without_suspension_ends_task() {
        let _ = tracing_subscriber::fmt::try_init();
        let event_loop = EventLoop::new();
        let polls = Rc::new(Cell::new(0));

        let polls_clone = Rc::clone(&polls);
        let task = event_loop.spawn(async move {
            std::future::poll_fn(|_| {
                polls_clone.set(polls_clone.get() + 1);
                Poll::<()>::Pending
            })
            .await;
        });

        event_loop.run_until_idle().unwrap();
        assert_eq!(polls.get(), 2, "Polled once, then once more to deliver the error");
        assert_eq!(event_loop.pending_callbacks(), 0, "Loop goes idle");
        assert_eq!(task.state(), TaskState::Done);
        match task.result() {
            Err(FutureError::ProtocolViolation(message)) => {
                assert!(message.contains("without suspending"), "Unexpected message: {}", message)
            }
            other => panic!("Expected ProtocolViolation, got {:?}", other),
        }
    }

    #[test]
    fn test_pending_without_suspension_can_be_recovered() {
        let event_loop = EventLoop::new();
        let future = event_loop.create_future::<i32>();
        future.resolve(3).unwrap();

        let waiter = future.clone();
        let task = event_loop.spawn(async move {
            let mut stalled = false;
            std::future::poll_fn(move |_| {
                if stalled {
                    Poll::Ready(())
                } else {
                    stalled = true;
                    Poll::Pending
                }
            })
            .await;
            // the next suspension point receives the error
            let refused = waiter.wait().await;
            (refused.is_err(), waiter.await)
        });

        event_loop.run_until_idle().unwrap();
        assert_eq!(task.result().unwrap(), (true, Ok(3)));
    }

    #[test]
    fn test_abandoned_suspended_task_is_freed() {
        let event_loop = EventLoop::new();
        let future = event_loop.create_future::<i32>();

        let waiter = future.clone();
        let task = event_loop.spawn_named("abandoned", async move { waiter.await });
        event_loop.run_until_idle().unwrap();
        assert_eq!(task.state(), TaskState::Suspended);

        let core = Rc::downgrade(&task.core);
        drop(task);
        assert_eq!(core.strong_count(), 0, "Task core still alive after its last handle was dropped");
        assert_eq!(future.callback_count(), 1, "Stale continuation stays registered");

        future.resolve(1).unwrap();
        event_loop.run_until_idle().unwrap();
        assert_eq!(event_loop.pending_callbacks(), 0);

        let loop_inner = Rc::downgrade(&event_loop.scheduler());
        drop(future);
        drop(event_loop);
        assert_eq!(loop_inner.strong_count(), 0, "Loop freed once every handle is gone");
    }

    #[test]
    fn test_task_ids_are_unique_and_increasing() {
        let event_loop = EventLoop::new();
        let first = event_loop.spawn(async {});
        let second = event_loop.spawn(async {});
        let third = Task::new(async {}, event_loop.scheduler(), None);

        assert!(first.id() < second.id(), "Ids increase in creation order");
        assert!(second.id() < third.id());
        event_loop.run_until_idle().unwrap();
    }

    #[test]
    fn test_yield_now_interleaves_tasks() {
        let event_loop = EventLoop::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b"] {
            let log = Rc::clone(&log);
            event_loop.spawn(async move {
                for i in 0..2 {
                    log.borrow_mut().push(format!("{}{}", name, i));
                    yield_now().await;
                }
            });
        }

        event_loop.run_until_idle().unwrap();
        assert_eq!(*log.borrow(), vec!["a0", "b0", "a1", "b1"]);
    }

    #[test]
    fn test_join_awaits_another_task() {
        let event_loop = EventLoop::new();
        let future = event_loop.create_future::<i32>();

        let waiter = future.clone();
        let inner = event_loop.spawn(async move { waiter.await.unwrap_or(-1) });
        let joined = inner.clone();
        let outer = event_loop.spawn(async move { joined.join().await.map(|v| v + 1) });

        let producer = future.clone();
        event_loop.call_soon(Box::new(move || producer.resolve(4).unwrap()));

        event_loop.run_until_idle().unwrap();
        assert_eq!(outer.result().unwrap(), Ok(5));
    }

    #[test]
    fn test_task_debug_representation() {
        let event_loop = EventLoop::new();
        let named = event_loop.spawn_named("worker", async { 1 });
        assert_eq!(format!("{:?}", named), "Task(name='worker', state=scheduled)");

        event_loop.run_until_idle().unwrap();
        assert_eq!(format!("{:?}", named), "Task(name='worker', state=done)");
        assert_eq!(named.name(), Some("worker"));
    }
}
