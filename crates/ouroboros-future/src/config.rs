//! Event loop configuration

use std::env;
use std::time::Duration;

use anyhow::Context;

/// Environment variable enabling debug mode (`1`, `true`, `yes`, `on`)
pub const ENV_DEBUG: &str = "OUROBOROS_LOOP_DEBUG";
/// Environment variable for the slow callback threshold in milliseconds
pub const ENV_SLOW_CALLBACK_MS: &str = "OUROBOROS_SLOW_CALLBACK_MS";
/// Environment variable for the per-cycle callback limit
pub const ENV_MAX_BATCH_SIZE: &str = "OUROBOROS_MAX_BATCH_SIZE";

/// Event loop configuration
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Time every callback and record slow ones
    pub debug: bool,
    /// Slow callback threshold
    pub slow_callback_duration: Duration,
    /// Maximum number of slow callbacks to keep
    pub max_slow_callbacks: usize,
    /// Maximum number of callbacks run by one `run_once` cycle
    pub max_batch_size: usize,
    /// Maximum number of exception contexts to keep
    pub max_exception_history: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            debug: false,
            slow_callback_duration: Duration::from_millis(100),
            max_slow_callbacks: 100,
            max_batch_size: 128,
            max_exception_history: 100,
        }
    }
}

impl LoopConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// Unset variables keep their defaults; values that do not parse are
    /// reported as errors.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = env::var(ENV_DEBUG) {
            config.debug = parse_flag(&raw)
                .with_context(|| format!("{} must be a boolean flag, got '{}'", ENV_DEBUG, raw))?;
        }

        if let Ok(raw) = env::var(ENV_SLOW_CALLBACK_MS) {
            let millis: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be milliseconds, got '{}'", ENV_SLOW_CALLBACK_MS, raw))?;
            config.slow_callback_duration = Duration::from_millis(millis);
        }

        if let Ok(raw) = env::var(ENV_MAX_BATCH_SIZE) {
            let size: usize = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer, got '{}'", ENV_MAX_BATCH_SIZE, raw))?;
            anyhow::ensure!(size > 0, "{} must be greater than zero", ENV_MAX_BATCH_SIZE);
            config.max_batch_size = size;
        }

        Ok(config)
    }

    /// Enable debug mode
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Set slow callback threshold
    pub fn slow_callback_duration(mut self, duration: Duration) -> Self {
        self.slow_callback_duration = duration;
        self
    }

    /// Set max slow callbacks to keep
    pub fn max_slow_callbacks(mut self, max: usize) -> Self {
        self.max_slow_callbacks = max;
        self
    }

    /// Set the per-cycle callback limit (at least 1)
    pub fn max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max.max(1);
        self
    }

    /// Set max exception contexts to keep
    pub fn max_exception_history(mut self, max: usize) -> Self {
        self.max_exception_history = max;
        self
    }
}

fn parse_flag(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("unrecognised flag value '{}'", other),
    }
}
