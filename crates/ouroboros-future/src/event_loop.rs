//! EventLoop: single-threaded cooperative scheduler
//!
//! The loop owns a FIFO queue of ready callbacks and runs them one at a time
//! on the calling thread. Futures and tasks created through it receive the
//! loop as their [`Schedule`] surface, so every callback, task step and task
//! continuation passes through the same queue.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use crate::config::LoopConfig;
use crate::debug::{DebugMonitor, LoopStatistics, SlowCallback};
use crate::error::{panic_message, FutureError, Result};
use crate::exception_handler::{context_from_error, ExceptionContext, ExceptionHandlerManager};
use crate::future::Future;
use crate::handle::Handle;
use crate::schedule::{Job, Schedule, Scheduler};
use crate::task::Task;

/// A job waiting in the ready queue together with its cancellation handle
struct ScheduledCallback {
    job: Job,
    handle: Handle,
}

struct LoopInner {
    ready: RefCell<VecDeque<ScheduledCallback>>,
    running: Cell<bool>,
    closed: Cell<bool>,
    stopped: Cell<bool>,
    config: LoopConfig,
    monitor: DebugMonitor,
    exceptions: ExceptionHandlerManager,
}

impl Schedule for LoopInner {
    fn call_soon(&self, job: Job) -> Handle {
        if self.closed.get() {
            tracing::warn!("Dropping callback scheduled on a closed event loop");
            return Handle::cancelled();
        }

        let handle = Handle::new();
        self.ready.borrow_mut().push_back(ScheduledCallback {
            job,
            handle: handle.clone(),
        });
        handle
    }
}

/// Marks the loop as running for the lifetime of a `run_*` call
struct RunGuard<'a> {
    inner: &'a LoopInner,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.inner.running.set(false);
        self.inner.stopped.set(false);
    }
}

/// Single-threaded event loop
///
/// Clones share the same queue, so a task body can hold a clone and spawn
/// more work onto the loop that runs it.
///
/// # Example
///
/// ```
/// use ouroboros_future::EventLoop;
///
/// let event_loop = EventLoop::new();
/// let future = event_loop.create_future::<i32>();
///
/// let waiter = future.clone();
/// let task = event_loop.spawn(async move { waiter.await.map(|v| v * 2) });
///
/// future.resolve(21).unwrap();
/// assert_eq!(event_loop.run_until_complete(task.future()).unwrap(), Ok(Ok(42)));
/// ```
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Create an event loop with default configuration
    pub fn new() -> Self {
        Self::with_config(LoopConfig::default())
    }

    /// Create an event loop with the given configuration
    pub fn with_config(config: LoopConfig) -> Self {
        tracing::debug!(
            debug = config.debug,
            max_batch_size = config.max_batch_size,
            "Creating event loop"
        );

        Self {
            inner: Rc::new(LoopInner {
                ready: RefCell::new(VecDeque::new()),
                running: Cell::new(false),
                closed: Cell::new(false),
                stopped: Cell::new(false),
                monitor: DebugMonitor::new(&config),
                exceptions: ExceptionHandlerManager::new(config.max_exception_history),
                config,
            }),
        }
    }

    /// Loop configuration
    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    /// The loop as a scheduling surface for futures and tasks
    pub fn scheduler(&self) -> Scheduler {
        Rc::clone(&self.inner) as Scheduler
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Schedule `job` to run on a later iteration
    ///
    /// On a closed loop the job is dropped and an already-cancelled handle
    /// is returned.
    pub fn call_soon(&self, job: Job) -> Handle {
        self.inner.call_soon(job)
    }

    /// Create a pending future bound to this loop
    pub fn create_future<T: 'static>(&self) -> Future<T> {
        Future::new(self.scheduler())
    }

    /// Wrap `body` in a task scheduled on this loop
    pub fn spawn<F>(&self, body: F) -> Task<F::Output>
    where
        F: std::future::Future + 'static,
        F::Output: 'static,
    {
        self.spawn_task(body, None)
    }

    /// Wrap `body` in a named task scheduled on this loop
    pub fn spawn_named<F>(&self, name: impl Into<String>, body: F) -> Task<F::Output>
    where
        F: std::future::Future + 'static,
        F::Output: 'static,
    {
        self.spawn_task(body, Some(name.into()))
    }

    fn spawn_task<F>(&self, body: F, name: Option<String>) -> Task<F::Output>
    where
        F: std::future::Future + 'static,
        F::Output: 'static,
    {
        let task = Task::new(body, self.scheduler(), name);
        self.inner.monitor.task_created();

        let inner = Rc::downgrade(&self.inner);
        let label = match task.name() {
            Some(name) => format!("Task(name='{}')", name),
            None => format!("Task(id={})", task.id()),
        };
        task.future().add_done_callback(move |outcome| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let failure = outcome.inspect(|result| result.as_ref().err().cloned()).flatten();
            match failure {
                Some(err) if err.is_cancelled() => inner.monitor.task_cancelled(),
                Some(err) => {
                    inner.monitor.task_completed();
                    let kind = match err {
                        FutureError::TaskPanicked(_) => "panic",
                        FutureError::ProtocolViolation(_) => "protocol_violation",
                        _ => "error",
                    };
                    let context = context_from_error(&err)
                        .exception_type(kind)
                        .task(label.clone())
                        .future(format!("{:?}", outcome));
                    inner.exceptions.call_exception_handler(context);
                }
                None => inner.monitor.task_completed(),
            }
        });

        task
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Run one cycle of the loop
    ///
    /// Runs the callbacks that were ready when the cycle started, up to
    /// `max_batch_size`, skipping cancelled ones. Callbacks scheduled during
    /// the cycle wait for the next one. Returns the number of callbacks run.
    pub fn run_once(&self) -> usize {
        self.inner.monitor.iteration();

        let batch = self
            .inner
            .ready
            .borrow()
            .len()
            .min(self.inner.config.max_batch_size);

        let mut executed = 0;
        for _ in 0..batch {
            let Some(scheduled) = self.inner.ready.borrow_mut().pop_front() else {
                break;
            };

            if scheduled.handle.is_cancelled() {
                continue;
            }

            self.run_callback(scheduled);
            executed += 1;
        }

        tracing::trace!(executed, batch, "Event loop cycle finished");
        executed
    }

    fn run_callback(&self, scheduled: ScheduledCallback) {
        let ScheduledCallback { job, handle } = scheduled;
        let timer = self.inner.monitor.start_callback();

        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            let message = panic_message(payload.as_ref());
            tracing::error!(panic = %message, "Scheduled callback panicked");
            self.inner.exceptions.call_exception_handler(
                ExceptionContext::new(format!("Exception in callback: {}", message))
                    .exception_type("panic")
                    .exception(message)
                    .handle(format!("{:?}", handle)),
            );
        }

        self.inner.monitor.end_callback(timer, "scheduled callback");
    }

    fn enter(&self) -> Result<RunGuard<'_>> {
        if self.inner.closed.get() {
            return Err(FutureError::InvalidState("Event loop is closed".to_string()));
        }
        if self.inner.running.get() {
            return Err(FutureError::InvalidState(
                "Event loop is already running".to_string(),
            ));
        }

        self.inner.running.set(true);
        self.inner.stopped.set(false);
        Ok(RunGuard { inner: &self.inner })
    }

    /// Run cycles until the ready queue is empty or `stop` is called
    ///
    /// Returns the total number of callbacks run.
    pub fn run_until_idle(&self) -> Result<usize> {
        let _guard = self.enter()?;

        let mut total = 0;
        while !self.inner.stopped.get() && !self.inner.ready.borrow().is_empty() {
            total += self.run_once();
        }

        tracing::debug!(callbacks = total, "Event loop idle");
        Ok(total)
    }

    /// Run cycles until `future` is resolved and return its result
    ///
    /// Fails with `LoopStopped` if `stop` is called, or if the loop runs out
    /// of ready callbacks, before the future resolves.
    pub fn run_until_complete<T>(&self, future: &Future<T>) -> Result<T>
    where
        T: Clone + 'static,
    {
        let _guard = self.enter()?;

        while !future.is_done() {
            if self.inner.stopped.get() {
                return Err(FutureError::LoopStopped(
                    "Event loop stopped before the future completed".to_string(),
                ));
            }
            if self.inner.ready.borrow().is_empty() {
                return Err(FutureError::LoopStopped(format!(
                    "Event loop ran out of work before {:?} completed",
                    future
                )));
            }
            self.run_once();
        }

        future.result()
    }

    /// Spawn `body` as a task and run the loop until it finishes
    ///
    /// A task left unfinished because the loop stopped is cancelled.
    pub fn block_on<F>(&self, body: F) -> Result<F::Output>
    where
        F: std::future::Future + 'static,
        F::Output: 'static,
    {
        let output = Rc::new(RefCell::new(None));

        let slot = Rc::clone(&output);
        let task = self.spawn(async move {
            let value = body.await;
            *slot.borrow_mut() = Some(value);
        });

        let finished = self.run_until_complete(task.future());
        if !task.is_done() {
            task.cancel();
        }
        finished??;

        let value = output.borrow_mut().take();
        value.ok_or_else(|| FutureError::InvalidState("Task finished without output".to_string()))
    }

    /// Ask a running loop to return after the current cycle
    pub fn stop(&self) {
        if self.inner.running.get() {
            tracing::debug!("Stopping event loop");
            self.inner.stopped.set(true);
        }
    }

    /// Close the loop, dropping any callbacks still queued
    ///
    /// Fails if the loop is running.
    pub fn close(&self) -> Result<()> {
        if self.inner.running.get() {
            return Err(FutureError::InvalidState(
                "Cannot close a running event loop".to_string(),
            ));
        }

        self.inner.closed.set(true);

        // Dropped outside the borrow; a job's captures may schedule on drop.
        let dropped: Vec<ScheduledCallback> = self.inner.ready.borrow_mut().drain(..).collect();
        tracing::debug!(dropped = dropped.len(), "Event loop closed");
        drop(dropped);
        Ok(())
    }

    /// Check if the event loop is running
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Check if the event loop is closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Number of callbacks in the ready queue, cancelled ones included
    pub fn pending_callbacks(&self) -> usize {
        self.inner.ready.borrow().len()
    }

    // ========================================================================
    // Debugging and exception handling
    // ========================================================================

    /// Toggle per-callback timing
    pub fn set_debug(&self, enabled: bool) {
        self.inner.monitor.set_debug(enabled);
    }

    /// Check if debug mode is enabled
    pub fn is_debug(&self) -> bool {
        self.inner.monitor.is_debug()
    }

    /// Snapshot of the loop counters
    pub fn statistics(&self) -> LoopStatistics {
        self.inner.monitor.get_statistics()
    }

    /// Reset the loop counters
    pub fn reset_statistics(&self) {
        self.inner.monitor.reset_statistics();
    }

    /// Slow callbacks recorded in debug mode, oldest first
    pub fn slow_callbacks(&self) -> Vec<SlowCallback> {
        self.inner.monitor.get_slow_callbacks()
    }

    /// Install a handler for failures with nowhere else to go
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&ExceptionContext) + 'static,
    {
        self.inner.exceptions.set_exception_handler(handler);
    }

    /// Revert to the default handler, which logs at error level
    pub fn clear_exception_handler(&self) {
        self.inner.exceptions.clear_exception_handler();
    }

    /// Pass `context` to the active exception handler
    pub fn call_exception_handler(&self, context: ExceptionContext) {
        self.inner.exceptions.call_exception_handler(context);
    }

    /// Exception contexts reported so far, oldest first
    pub fn exception_history(&self) -> Vec<ExceptionContext> {
        self.inner.exceptions.get_history()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventLoop(running={}, closed={})",
            self.inner.running.get(),
            self.inner.closed.get()
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
