//! Post-load quality gate.
//!
//! Every check runs independently and read-only against the current target
//! state; one failing or unusable check never prevents the others from
//! running. The gate passes only when no check failed.

use std::collections::BTreeMap;

use stagewise_store::{Statement, TargetStore};
use stagewise_types::{
    CheckDefinition, CheckId, QualityCheck, StageError, StageResult, StageStatus, Value,
};

use crate::render;

/// Outcome of one check. `Skipped` marks an unusable definition.
pub type CheckOutcome = StageResult;

/// Per-check outcomes of one gate run, ordered by [`CheckId`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateReport {
    pub results: BTreeMap<CheckId, CheckOutcome>,
}

impl GateReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        !self.results.values().any(StageResult::is_failure)
    }

    fn ids_with(&self, status: StageStatus) -> Vec<&CheckId> {
        self.results
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id)
            .collect()
    }

    #[must_use]
    pub fn failed(&self) -> Vec<&CheckId> {
        self.ids_with(StageStatus::Failed)
    }

    #[must_use]
    pub fn skipped(&self) -> Vec<&CheckId> {
        self.ids_with(StageStatus::Skipped)
    }

    /// Collapse the report into the gate stage's result.
    ///
    /// # Errors
    ///
    /// Returns a non-retryable quality [`StageError`] naming every failed check.
    pub fn into_stage_result(self) -> Result<StageResult, StageError> {
        let total = self.results.len();
        let failed = self.failed();
        if !failed.is_empty() {
            let details: Vec<String> = failed
                .iter()
                .map(|id| format!("{id} ({})", self.results[*id].reason))
                .collect();
            return Err(StageError::quality(format!(
                "{} of {total} quality checks failed: {}",
                failed.len(),
                details.join("; ")
            )));
        }
        let skipped = self.skipped().len();
        Ok(StageResult::succeeded(
            format!("{} of {total} checks passed, {skipped} skipped", total - skipped),
            0,
        ))
    }
}

/// Run every check in `checks` against `store`.
#[must_use]
pub fn run(checks: &[CheckDefinition], store: &dyn TargetStore) -> GateReport {
    let mut report = GateReport::default();

    for (index, definition) in checks.iter().enumerate() {
        let (id, outcome) = match definition.compile() {
            Ok(check) => {
                let id = CheckId::new(index, check.kind(), check.subject());
                let outcome = evaluate(&check, store);
                (id, outcome)
            }
            Err(problem) => {
                let kind = definition.declared_type().unwrap_or("unknown");
                let id = CheckId::new(index, kind, subject_hint(definition));
                tracing::warn!(check = %id, problem = %problem, "Unusable quality check, skipping");
                (id, StageResult::skipped(problem))
            }
        };

        match outcome.status {
            StageStatus::Succeeded => {
                tracing::info!(check = %id, reason = %outcome.reason, "Quality check passed");
            }
            StageStatus::Failed => {
                tracing::error!(check = %id, reason = %outcome.reason, "Quality check failed");
            }
            _ => {}
        }
        report.results.insert(id, outcome);
    }

    report
}

fn subject_hint(definition: &CheckDefinition) -> &str {
    let raw = definition.raw();
    raw.get("table")
        .or_else(|| raw.get("name"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("-")
}

/// Evaluate one typed check.
#[must_use]
pub fn evaluate(check: &QualityCheck, store: &dyn TargetStore) -> CheckOutcome {
    match check {
        QualityCheck::RowCount { table } => match count(store, &render::row_count(table)) {
            Ok(Some(0)) => fail("empty table"),
            Ok(Some(n)) => StageResult::succeeded(format!("{n} rows"), 0),
            Ok(None) => fail("no result"),
            Err(reason) => fail(reason),
        },
        QualityCheck::Uniqueness {
            table,
            key,
            expected_duplicates,
        } => match count(store, &render::duplicated_keys(table, key)) {
            Ok(Some(n)) if n == *expected_duplicates => {
                StageResult::succeeded(format!("{n} duplicated key values"), 0)
            }
            Ok(Some(n)) => fail(format!(
                "expected {expected_duplicates} duplicated key values, found {n}"
            )),
            Ok(None) => fail("no result"),
            Err(reason) => fail(reason),
        },
        QualityCheck::NotNull { table, field } => {
            match count(store, &render::null_count(table, field)) {
                Ok(Some(0)) => StageResult::succeeded(format!("no NULL {field}"), 0),
                Ok(Some(n)) => fail(format!("{n} rows with NULL {field}")),
                Ok(None) => fail("no result"),
                Err(reason) => fail(reason),
            }
        }
        QualityCheck::Custom { sql, expected, .. } => match count(store, &Statement::new(sql.clone())) {
            Ok(Some(n)) if n == *expected => StageResult::succeeded(format!("returned {n}"), 0),
            Ok(Some(n)) => fail(format!("expected {expected}, got {n}")),
            Ok(None) => fail("no result"),
            Err(reason) => fail(reason),
        },
    }
}

fn fail(reason: impl Into<String>) -> CheckOutcome {
    StageResult::failed(&StageError::quality(reason))
}

/// First cell of the query as an integer; `Ok(None)` when no row came back.
///
/// Fractional results are an error rather than being truncated.
fn count(store: &dyn TargetStore, stmt: &Statement) -> Result<Option<i64>, String> {
    let result = store.query(stmt).map_err(|e| format!("query failed: {e}"))?;
    let Some(value) = result.scalar() else {
        return Ok(None);
    };
    let exact = match value {
        Value::Int(n) => Some(*n),
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
        Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Some(*f as i64),
        Value::Text(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    exact
        .map(Some)
        .ok_or_else(|| format!("expected an integer result, got '{value}'"))
}
