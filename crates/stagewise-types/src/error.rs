//! Structured error model for stage execution.
//!
//! [`StageError`] carries a category and a retry flag so the coordinator can
//! decide between retrying, failing, and skipping dependents without knowing
//! which component raised it. Construct via the category-specific factories.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid insert mode, missing spec field, malformed definition.
    Configuration,
    /// Extraction failure from a row source (retryable).
    Source,
    /// Failure while applying a plan; the unit of work was rolled back (retryable).
    Transaction,
    /// A quality check did not hold. Terminal for the run.
    QualityCheck,
    /// The stage exceeded its time budget (retryable).
    Timeout,
    /// Host-side failure: panicked task, poisoned lock.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Configuration => "configuration",
            Self::Source => "source",
            Self::Transaction => "transaction",
            Self::QualityCheck => "quality_check",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Categorized failure raised inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {message}")]
pub struct StageError {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
}

impl StageError {
    fn new(category: ErrorCategory, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            retryable,
        }
    }

    /// Configuration error (not retryable).
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, false, message)
    }

    /// Row source error (retryable).
    #[must_use]
    pub fn source(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Source, true, message)
    }

    /// Plan execution error after rollback (retryable).
    #[must_use]
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transaction, true, message)
    }

    /// Failed quality check (never retried).
    #[must_use]
    pub fn quality(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::QualityCheck, false, message)
    }

    /// Stage deadline exceeded (retryable).
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, true, message)
    }

    /// Host-side failure (not retryable).
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, false, message)
    }
}

/// Invalid pipeline or table definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("configuration error: {message}")]
pub struct ConfigurationError {
    pub message: String,
}

impl ConfigurationError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ConfigurationError> for StageError {
    fn from(err: ConfigurationError) -> Self {
        Self::configuration(err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_flags_follow_category() {
        assert!(!StageError::configuration("x").retryable);
        assert!(StageError::source("x").retryable);
        assert!(StageError::transaction("x").retryable);
        assert!(!StageError::quality("x").retryable);
        assert!(StageError::timeout("x").retryable);
        assert!(!StageError::internal("x").retryable);
    }

    #[test]
    fn display_includes_category() {
        let err = StageError::transaction("constraint violated");
        assert_eq!(err.to_string(), "[transaction] constraint violated");
    }

    #[test]
    fn configuration_error_converts_to_stage_error() {
        let err: StageError = ConfigurationError::new("unknown insert mode 'merge'").into();
        assert_eq!(err.category, ErrorCategory::Configuration);
        assert!(err.message.contains("merge"));
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::QualityCheck).unwrap();
        assert_eq!(json, "\"quality_check\"");
    }
}
