//! Run and stage outcome types.
//!
//! Pure data shared by the run history store, the coordinator and the CLI.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, StageError};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque pipeline identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(String);

impl PipelineId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique stage name within one pipeline (e.g. `"load_user_dim_table"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageName(String);

impl StageName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for StageName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Row id of a persisted run.
pub type RunId = i64;

// ---------------------------------------------------------------------------
// Stage outcomes
// ---------------------------------------------------------------------------

/// Lifecycle state of one stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Never started: an upstream stage failed, the run was cancelled, or
    /// (for quality checks) the definition was unusable.
    Skipped,
}

impl StageStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a stage, a load, or a single quality check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatus,
    pub reason: String,
    #[serde(default)]
    pub rows_affected: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
}

impl StageResult {
    #[must_use]
    pub fn succeeded(reason: impl Into<String>, rows_affected: u64) -> Self {
        Self {
            status: StageStatus::Succeeded,
            reason: reason.into(),
            rows_affected,
            attempts: 0,
            error_category: None,
        }
    }

    #[must_use]
    pub fn failed(error: &StageError) -> Self {
        Self {
            status: StageStatus::Failed,
            reason: error.message.clone(),
            rows_affected: 0,
            attempts: 0,
            error_category: Some(error.category),
        }
    }

    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skipped,
            reason: reason.into(),
            rows_affected: 0,
            attempts: 0,
            error_category: None,
        }
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status == StageStatus::Failed
    }
}

// ---------------------------------------------------------------------------
// Run outcome
// ---------------------------------------------------------------------------

/// Run-level result reported to the operator.
///
/// `Failed` dominates `PartiallySkipped`, which dominates `Succeeded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed { stage: StageName, reason: String },
    PartiallySkipped { skipped: Vec<StageName> },
}

impl RunOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::PartiallySkipped { .. } => "partially_skipped",
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed { stage, reason } => write!(f, "failed at '{stage}': {reason}"),
            Self::PartiallySkipped { skipped } => {
                let names: Vec<&str> = skipped.iter().map(StageName::as_str).collect();
                write!(f, "partially skipped: {}", names.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_result_carries_category_and_reason() {
        let err = StageError::source("locator 'song_data' not found");
        let result = StageResult::failed(&err).with_attempts(4);
        assert!(result.is_failure());
        assert_eq!(result.error_category, Some(ErrorCategory::Source));
        assert_eq!(result.attempts, 4);
        assert!(result.reason.contains("song_data"));
    }

    #[test]
    fn terminal_states() {
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        assert!(StageStatus::Succeeded.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
    }

    #[test]
    fn run_outcome_display() {
        let outcome = RunOutcome::Failed {
            stage: StageName::new("stage_songs"),
            reason: "source unavailable".into(),
        };
        assert_eq!(outcome.to_string(), "failed at 'stage_songs': source unavailable");
        assert_eq!(outcome.as_str(), "failed");

        let outcome = RunOutcome::PartiallySkipped {
            skipped: vec![StageName::new("a"), StageName::new("b")],
        };
        assert_eq!(outcome.to_string(), "partially skipped: a, b");
    }

    #[test]
    fn run_outcome_serializes_tagged() {
        let json = serde_json::to_value(RunOutcome::Succeeded).unwrap();
        assert_eq!(json, serde_json::json!({"status": "succeeded"}));
    }
}
