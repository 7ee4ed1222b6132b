//! Event loop debugging tools
//!
//! Counts callbacks, iterations and task lifecycles for every loop, and in
//! debug mode times each callback and keeps a bounded record of the slow
//! ones.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::LoopConfig;

// ============================================================================
// Slow Callback Record
// ============================================================================

/// Record of a slow callback
#[derive(Debug, Clone)]
pub struct SlowCallback {
    /// Callback description
    pub name: String,
    /// Duration the callback took
    pub duration: Duration,
    /// When the callback started
    pub started_at: Instant,
}

impl SlowCallback {
    /// Create a new slow callback record
    pub fn new(name: impl Into<String>, duration: Duration, started_at: Instant) -> Self {
        Self {
            name: name.into(),
            duration,
            started_at,
        }
    }

    /// Get duration in milliseconds
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

// ============================================================================
// Loop Statistics
// ============================================================================

/// Snapshot of event loop counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStatistics {
    /// Total callbacks executed
    pub callbacks_executed: u64,
    /// Total time spent in timed callbacks
    pub total_callback_time: Duration,
    /// Number of callbacks timed in debug mode
    pub callbacks_timed: u64,
    /// Number of slow callbacks detected
    pub slow_callbacks_count: u64,
    /// Number of tasks created
    pub tasks_created: u64,
    /// Number of tasks completed
    pub tasks_completed: u64,
    /// Number of tasks cancelled
    pub tasks_cancelled: u64,
    /// Tasks created but not yet finished
    pub pending_tasks: u64,
    /// Loop iterations
    pub iterations: u64,
}

impl LoopStatistics {
    /// Average duration of the callbacks timed in debug mode
    pub fn average_callback_duration(&self) -> Duration {
        if self.callbacks_timed == 0 {
            Duration::ZERO
        } else {
            self.total_callback_time / self.callbacks_timed as u32
        }
    }

    /// Get slow callback percentage
    pub fn slow_callback_percentage(&self) -> f64 {
        if self.callbacks_executed == 0 {
            0.0
        } else {
            (self.slow_callbacks_count as f64 / self.callbacks_executed as f64) * 100.0
        }
    }
}

// ============================================================================
// Debug Monitor
// ============================================================================

/// Event loop debug monitor
pub struct DebugMonitor {
    enabled: Cell<bool>,
    slow_callback_duration: Cell<Duration>,
    max_slow_callbacks: usize,
    slow_callbacks: RefCell<VecDeque<SlowCallback>>,
    stats: RefCell<LoopStatistics>,
}

impl DebugMonitor {
    /// Create a new debug monitor
    pub fn new(config: &LoopConfig) -> Self {
        Self {
            enabled: Cell::new(config.debug),
            slow_callback_duration: Cell::new(config.slow_callback_duration),
            max_slow_callbacks: config.max_slow_callbacks,
            slow_callbacks: RefCell::new(VecDeque::new()),
            stats: RefCell::new(LoopStatistics::default()),
        }
    }

    /// Enable debug mode
    pub fn set_debug(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    /// Check if debug mode is enabled
    pub fn is_debug(&self) -> bool {
        self.enabled.get()
    }

    /// Set slow callback duration threshold
    pub fn set_slow_callback_duration(&self, duration: Duration) {
        self.slow_callback_duration.set(duration);
    }

    /// Get slow callback duration threshold
    pub fn slow_callback_duration(&self) -> Duration {
        self.slow_callback_duration.get()
    }

    /// Start timing a callback. Returns `None` outside debug mode.
    pub fn start_callback(&self) -> Option<CallbackTimer> {
        if self.enabled.get() {
            Some(CallbackTimer {
                start: Instant::now(),
            })
        } else {
            None
        }
    }

    /// Record callback completion
    pub fn end_callback(&self, timer: Option<CallbackTimer>, name: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.callbacks_executed += 1;

        let Some(timer) = timer else {
            return;
        };

        let duration = timer.start.elapsed();
        stats.callbacks_timed += 1;
        stats.total_callback_time += duration;

        let threshold = self.slow_callback_duration.get();
        if duration <= threshold {
            return;
        }

        stats.slow_callbacks_count += 1;
        let record = SlowCallback::new(name, duration, timer.start);

        tracing::warn!(
            callback = name,
            duration_ms = record.duration_ms(),
            threshold_ms = threshold.as_secs_f64() * 1000.0,
            "Slow callback detected"
        );

        let mut slow_callbacks = self.slow_callbacks.borrow_mut();
        slow_callbacks.push_back(record);
        while slow_callbacks.len() > self.max_slow_callbacks {
            slow_callbacks.pop_front();
        }
    }

    /// Record task creation
    pub fn task_created(&self) {
        self.stats.borrow_mut().tasks_created += 1;
    }

    /// Record task completion
    pub fn task_completed(&self) {
        self.stats.borrow_mut().tasks_completed += 1;
    }

    /// Record task cancellation
    pub fn task_cancelled(&self) {
        self.stats.borrow_mut().tasks_cancelled += 1;
    }

    /// Record loop iteration
    pub fn iteration(&self) {
        self.stats.borrow_mut().iterations += 1;
    }

    /// Get recent slow callbacks, oldest first
    pub fn get_slow_callbacks(&self) -> Vec<SlowCallback> {
        self.slow_callbacks.borrow().iter().cloned().collect()
    }

    /// Clear slow callback history
    pub fn clear_slow_callbacks(&self) {
        self.slow_callbacks.borrow_mut().clear();
    }

    /// Get current statistics
    pub fn get_statistics(&self) -> LoopStatistics {
        let mut stats = self.stats.borrow().clone();
        stats.pending_tasks = stats
            .tasks_created
            .saturating_sub(stats.tasks_completed + stats.tasks_cancelled);
        stats
    }

    /// Reset statistics
    pub fn reset_statistics(&self) {
        *self.stats.borrow_mut() = LoopStatistics::default();
    }
}

impl Default for DebugMonitor {
    fn default() -> Self {
        Self::new(&LoopConfig::default())
    }
}

// ============================================================================
// Callback Timer
// ============================================================================

/// Timer for measuring callback duration
pub struct CallbackTimer {
    start: Instant,
}

impl CallbackTimer {
    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// ============================================================================
// Tests
// ============================================================================
