//! Pipeline run and check result types.

use std::time::Duration;

use stagewise_types::{PipelineId, RunId, RunOutcome, StageName, StageResult, StageStatus, TimeRange};

/// Final state of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: StageName,
    pub kind: &'static str,
    pub result: StageResult,
}

/// Result of a pipeline run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub pipeline: PipelineId,
    /// Row id in the run history, when one is attached.
    pub run_id: Option<RunId>,
    pub window: TimeRange,
    /// Every stage, in dependency order.
    pub stages: Vec<StageReport>,
    pub outcome: RunOutcome,
    pub duration: Duration,
}

impl RunReport {
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages
            .iter()
            .find(|s| s.name.as_str() == name)
            .map(|s| &s.result)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.result.status == status).count()
    }

    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(StageStatus::Succeeded)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(StageStatus::Failed)
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(StageStatus::Skipped)
    }

    /// Total retries across stages.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.result.attempts.saturating_sub(1))
            .sum()
    }
}

/// Result of a pipeline check.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    pub stage_count: usize,
    /// Non-fatal problems, such as quality checks that will be skipped.
    pub warnings: Vec<String>,
    pub store_ok: bool,
    pub state_ok: bool,
}

impl CheckResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.store_ok && self.state_ok
    }
}
