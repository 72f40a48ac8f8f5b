//! Pipeline error model and stage retry policy.

use std::time::Duration;

use stagewise_types::{ConfigurationError, StageError};

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRIES: u32 = 3;
/// Default fixed delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// PipelineError: failures that prevent a run from starting
// ---------------------------------------------------------------------------

/// Error that stops a pipeline before or around stage execution.
///
/// Failures *inside* a stage never surface here: they become a
/// [`StageResult`](stagewise_types::StageResult) and the run report carries
/// them. `Configuration` means the definition itself is unusable;
/// `Infrastructure` wraps store, history and runtime failures.
#[derive(Debug)]
pub enum PipelineError {
    /// The pipeline definition cannot be turned into a stage graph.
    Configuration(ConfigurationError),
    /// Host-side failure (opening the store, provisioning tables, etc.)
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(e) => write!(f, "{e}"),
            Self::Infrastructure(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<ConfigurationError> for PipelineError {
    fn from(e: ConfigurationError) -> Self {
        Self::Configuration(e)
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Per-stage retry and timeout policy.
///
/// Retries use a fixed delay. Only errors flagged retryable are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no timeout.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Total attempts allowed, the first one included.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Whether `attempt` (1-based) failing with `err` earns another attempt.
    #[must_use]
    pub fn should_retry(&self, err: &StageError, attempt: u32) -> bool {
        err.retryable && attempt <= self.retries
    }
}
