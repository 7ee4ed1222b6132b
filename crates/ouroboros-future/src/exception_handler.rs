//! Exception handling for the event loop
//!
//! Failures that have no awaiting task to land in (a scheduled callback
//! that panics, for instance) are described by an [`ExceptionContext`] and
//! routed through the loop's [`ExceptionHandlerManager`]. Without a custom
//! handler the context is logged at error level.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

// ============================================================================
// Exception Context
// ============================================================================

/// Context information for an exception
#[derive(Debug, Clone)]
pub struct ExceptionContext {
    /// The exception message
    pub message: String,
    /// The exception type/name
    pub exception_type: Option<String>,
    /// The exception itself (as string representation)
    pub exception: Option<String>,
    /// Future involved
    pub future: Option<String>,
    /// Handle of the callback that failed
    pub handle: Option<String>,
    /// Task involved
    pub task: Option<String>,
    /// Additional context data
    pub extra: HashMap<String, String>,
}

impl ExceptionContext {
    /// Create a new exception context
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exception_type: None,
            exception: None,
            future: None,
            handle: None,
            task: None,
            extra: HashMap::new(),
        }
    }

    /// Set exception type
    pub fn exception_type(mut self, typ: impl Into<String>) -> Self {
        self.exception_type = Some(typ.into());
        self
    }

    /// Set exception
    pub fn exception(mut self, exc: impl Into<String>) -> Self {
        self.exception = Some(exc.into());
        self
    }

    /// Set future
    pub fn future(mut self, future: impl Into<String>) -> Self {
        self.future = Some(future.into());
        self
    }

    /// Set handle
    pub fn handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    /// Set task
    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Add extra context
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Get a context value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "message" => Some(&self.message),
            "exception_type" => self.exception_type.as_deref(),
            "exception" => self.exception.as_deref(),
            "future" => self.future.as_deref(),
            "handle" => self.handle.as_deref(),
            "task" => self.task.as_deref(),
            _ => self.extra.get(key).map(|s| s.as_str()),
        }
    }

    /// Format context for logging
    pub fn format(&self) -> String {
        let mut parts = vec![format!("Message: {}", self.message)];

        if let Some(ref exc_type) = self.exception_type {
            parts.push(format!("Exception type: {}", exc_type));
        }
        if let Some(ref exc) = self.exception {
            parts.push(format!("Exception: {}", exc));
        }
        if let Some(ref future) = self.future {
            parts.push(format!("Future: {}", future));
        }
        if let Some(ref handle) = self.handle {
            parts.push(format!("Handle: {}", handle));
        }
        if let Some(ref task) = self.task {
            parts.push(format!("Task: {}", task));
        }

        let mut extra: Vec<_> = self.extra.iter().collect();
        extra.sort();
        for (key, value) in extra {
            parts.push(format!("{}: {}", key, value));
        }

        parts.join("\n")
    }
}

/// Create context from an error
pub fn context_from_error(error: &dyn std::error::Error) -> ExceptionContext {
    let mut context = ExceptionContext::new(error.to_string())
        .exception(error.to_string());

    if let Some(source) = error.source() {
        context.extra.insert("source".to_string(), source.to_string());
    }

    context
}

// ============================================================================
// Exception Handler
// ============================================================================

/// Exception handler function type
pub type ExceptionHandlerFn = Rc<dyn Fn(&ExceptionContext)>;

/// Exception handler manager
pub struct ExceptionHandlerManager {
    custom_handler: RefCell<Option<ExceptionHandlerFn>>,
    history: RefCell<VecDeque<ExceptionContext>>,
    max_history: usize,
}

impl ExceptionHandlerManager {
    /// Create a new exception handler manager keeping up to `max_history`
    /// contexts
    pub fn new(max_history: usize) -> Self {
        Self {
            custom_handler: RefCell::new(None),
            history: RefCell::new(VecDeque::new()),
            max_history,
        }
    }

    /// Set custom exception handler
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&ExceptionContext) + 'static,
    {
        *self.custom_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Whether a custom handler is installed
    pub fn has_custom_handler(&self) -> bool {
        self.custom_handler.borrow().is_some()
    }

    /// Clear custom exception handler (revert to default)
    pub fn clear_exception_handler(&self) {
        *self.custom_handler.borrow_mut() = None;
    }

    /// Record `context` and pass it to the active handler
    pub fn call_exception_handler(&self, context: ExceptionContext) {
        {
            let mut history = self.history.borrow_mut();
            history.push_back(context.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        // Released before the call so the handler may replace itself.
        let handler = self.custom_handler.borrow().clone();
        match handler {
            Some(handler) => handler(&context),
            None => Self::default_exception_handler(&context),
        }
    }

    fn default_exception_handler(context: &ExceptionContext) {
        tracing::error!(
            exception_type = context.exception_type.as_deref().unwrap_or("unknown"),
            "Unhandled exception in event loop:\n{}",
            context.format()
        );
    }

    /// Get exception history, oldest first
    pub fn get_history(&self) -> Vec<ExceptionContext> {
        self.history.borrow().iter().cloned().collect()
    }

    /// Clear exception history
    pub fn clear_history(&self) {
        self.history.borrow_mut().clear();
    }

    /// Get recent exceptions count
    pub fn recent_exception_count(&self) -> usize {
        self.history.borrow().len()
    }
}

impl Default for ExceptionHandlerManager {
    fn default() -> Self {
        Self::new(100)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::error::FutureError;

    #[test]
    fn test_exception_context() {
        let ctx = ExceptionContext::new("Test error")
            .exception_type("panic")
            .exception("boom")
            .task("Task(name='worker', state=running)")
            .extra("custom_key", "custom_value");

        assert_eq!(ctx.message, "Test error");
        assert_eq!(ctx.exception_type, Some("panic".to_string()));
        assert_eq!(ctx.get("task"), Some("Task(name='worker', state=running)"));
        assert_eq!(ctx.get("custom_key"), Some("custom_value"));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn test_context_format() {
        let ctx = ExceptionContext::new("Test error")
            .exception_type("panic")
            .handle("Handle(cancelled=false)")
            .extra("b", "2")
            .extra("a", "1");

        let formatted = ctx.format();
        assert!(formatted.starts_with("Message: Test error"));
        assert!(formatted.contains("Exception type: panic"));
        assert!(formatted.contains("Handle: Handle(cancelled=false)"));
        assert!(formatted.ends_with("a: 1\nb: 2"), "Extra keys are sorted: {}", formatted);
    }

    #[test]
    fn test_context_from_error() {
        let error = FutureError::InvalidState("Future is not done yet".to_string());
        let ctx = context_from_error(&error);

        assert_eq!(ctx.message, "Invalid state: Future is not done yet");
        assert_eq!(ctx.exception.as_deref(), Some("Invalid state: Future is not done yet"));
    }

    #[test]
    fn test_default_handler_records_history() {
        let _ = tracing_subscriber::fmt::try_init();
        let manager = ExceptionHandlerManager::default();

        manager.call_exception_handler(ExceptionContext::new("Test exception"));

        assert!(!manager.has_custom_handler());
        assert_eq!(manager.recent_exception_count(), 1);
    }

    #[test]
    fn test_custom_exception_handler() {
        let manager = ExceptionHandlerManager::default();
        let counter = Rc::new(Cell::new(0));

        let counter_clone = Rc::clone(&counter);
        manager.set_exception_handler(move |_ctx| {
            counter_clone.set(counter_clone.get() + 1);
        });

        manager.call_exception_handler(ExceptionContext::new("Test"));
        assert_eq!(counter.get(), 1);

        manager.clear_exception_handler();
        assert!(!manager.has_custom_handler());
    }

    #[test]
    fn test_handler_may_replace_itself() {
        let manager = Rc::new(ExceptionHandlerManager::default());

        let inner = Rc::clone(&manager);
        manager.set_exception_handler(move |_| inner.clear_exception_handler());

        manager.call_exception_handler(ExceptionContext::new("first"));
        assert!(!manager.has_custom_handler());
    }

    #[test]
    fn test_exception_history_is_bounded() {
        let manager = ExceptionHandlerManager::new(2);
        manager.set_exception_handler(|_| {});

        manager.call_exception_handler(ExceptionContext::new("Error 1"));
        manager.call_exception_handler(ExceptionContext::new("Error 2"));
        manager.call_exception_handler(ExceptionContext::new("Error 3"));

        let history = manager.get_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "Error 2");
        assert_eq!(history[1].message, "Error 3");

        manager.clear_history();
        assert_eq!(manager.recent_exception_count(), 0);
    }
}
