//! Load execution: one merge plan, one transaction.
//!
//! The executor begins a transaction, creates and fills the scratch table,
//! runs every merge step in order, drops the scratch table and commits. Any
//! failure rolls the whole unit back, so the target is either fully merged or
//! untouched. The executor never retries; that is the coordinator's call.

use std::fmt;
use std::time::Instant;

use stagewise_store::{Statement, StoreError, StoreTransaction, TargetStore};
use stagewise_types::{StageError, StageResult};

use crate::plan::{MergePlan, MergeStep, Operation, ScratchTable};
use crate::render;

/// Row counts of an applied plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub inserted: u64,
    pub updated: u64,
    /// Target rows removed by a truncate.
    pub deleted: u64,
    /// Batch rows dropped because their key already existed.
    pub already_present: u64,
}

impl LoadSummary {
    /// Target rows written (inserted or updated).
    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl fmt::Display for LoadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserted {}, updated {}, deleted {}",
            self.inserted, self.updated, self.deleted
        )
    }
}

/// Apply `plan` and report the outcome as a [`StageResult`].
///
/// `deadline` is checked between operations; once passed, the transaction
/// is rolled back rather than committed late.
pub fn execute(plan: &MergePlan, store: &dyn TargetStore, deadline: Option<Instant>) -> StageResult {
    match apply(plan, store, deadline) {
        Ok(summary) => StageResult::succeeded(summary.to_string(), summary.rows_affected()),
        Err(err) => StageResult::failed(&err),
    }
}

/// Apply `plan` in a single transaction.
///
/// # Errors
///
/// Returns a retryable transaction [`StageError`] when any statement,
/// the commit, or the deadline fails. The target is unchanged in that case.
pub fn apply(
    plan: &MergePlan,
    store: &dyn TargetStore,
    deadline: Option<Instant>,
) -> Result<LoadSummary, StageError> {
    let table = plan.target.name.as_str();
    let Some(scratch) = plan.scratch.as_ref().filter(|_| !plan.is_noop()) else {
        tracing::info!(table, "No rows to merge, skipping load");
        return Ok(LoadSummary::default());
    };

    let mut tx = store
        .begin()
        .map_err(|e| tx_error(table, "begin transaction", &e))?;

    let outcome = run_operations(tx.as_mut(), plan, scratch, deadline).and_then(|summary| {
        if past(deadline) {
            return Err(StageError::transaction(format!(
                "load of '{table}' passed its deadline before commit"
            )));
        }
        Ok(summary)
    });

    match outcome {
        Ok(summary) => {
            tx.commit().map_err(|e| tx_error(table, "commit", &e))?;
            tracing::info!(
                table,
                mode = %plan.target.mode,
                rows = plan.row_count(),
                inserted = summary.inserted,
                updated = summary.updated,
                deleted = summary.deleted,
                "Merged batch"
            );
            Ok(summary)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                tracing::warn!(table, error = %rollback_err, "Rollback failed");
            }
            tracing::warn!(table, error = %err, "Load rolled back");
            Err(err)
        }
    }
}

fn run_operations(
    tx: &mut dyn StoreTransaction,
    plan: &MergePlan,
    scratch: &ScratchTable,
    deadline: Option<Instant>,
) -> Result<LoadSummary, StageError> {
    let table = plan.target.name.as_str();
    let mut summary = LoadSummary::default();
    let mut guard = ScratchGuard::new(tx, &scratch.name);

    for op in plan.operations() {
        if past(deadline) {
            return Err(StageError::transaction(format!(
                "load of '{table}' passed its deadline before {op}"
            )));
        }
        tracing::debug!(table, operation = %op, "Running merge operation");

        match op {
            Operation::CreateScratch => {
                guard.execute(&render::create_scratch(scratch), table, op)?;
                guard.armed = true;
            }
            Operation::PopulateScratch => {
                for stmt in render::populate_scratch(scratch) {
                    guard.execute(&stmt, table, op)?;
                }
            }
            Operation::Step(step) => {
                let stmt = render::merge_step(step, table, &plan.target.primary_key, scratch);
                let affected = guard.execute(&stmt, table, op)?;
                match step {
                    MergeStep::Truncate => summary.deleted += affected,
                    MergeStep::UpdateExisting { .. } => summary.updated += affected,
                    MergeStep::DeleteScratchRowsInTarget => summary.already_present += affected,
                    MergeStep::InsertNew { .. } => summary.inserted += affected,
                }
            }
            Operation::DropScratch => guard.release(table)?,
        }
    }

    Ok(summary)
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn tx_error(table: &str, what: &str, err: &StoreError) -> StageError {
    StageError::transaction(format!("load of '{table}' failed to {what}: {err}"))
}

/// Drops the scratch table on every path out of [`run_operations`].
///
/// A successful run releases it explicitly as the last operation; an early
/// return or a panic drops it from `Drop`, before the transaction itself is
/// rolled back.
struct ScratchGuard<'g> {
    tx: &'g mut dyn StoreTransaction,
    name: &'g str,
    armed: bool,
}

impl<'g> ScratchGuard<'g> {
    fn new(tx: &'g mut dyn StoreTransaction, name: &'g str) -> Self {
        Self {
            tx,
            name,
            armed: false,
        }
    }

    fn execute(&mut self, stmt: &Statement, table: &str, op: Operation<'_>) -> Result<u64, StageError> {
        self.tx
            .execute(stmt)
            .map_err(|e| tx_error(table, &op.to_string(), &e))
    }

    fn release(&mut self, table: &str) -> Result<(), StageError> {
        self.armed = false;
        self.execute(&render::drop_scratch(self.name), table, Operation::DropScratch)
            .map(|_| ())
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.tx.execute(&render::drop_scratch(self.name)) {
                tracing::warn!(scratch = self.name, error = %e, "Failed to drop scratch table");
            }
        }
    }
}
