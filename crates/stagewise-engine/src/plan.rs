//! Merge planning.
//!
//! [`plan`] turns a resolved batch and a [`TargetTableSpec`] into a
//! [`MergePlan`]: a scratch table holding the batch plus an ordered list of
//! typed [`MergeStep`]s. Planning is pure. SQL text is produced only when the
//! executor renders each step, so plans can be inspected and compared in
//! tests without a store.

use std::collections::BTreeMap;
use std::fmt;

use stagewise_types::{ConfigurationError, InsertMode, KeyValue, StagedRow, TargetTableSpec, Value};

/// Suffix appended to the target name to form the scratch table name.
pub const SCRATCH_SUFFIX: &str = "__stagewise_scratch";

/// Temporary table carrying the resolved batch for one plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchTable {
    pub name: String,
    /// Same order as the target spec's field list.
    pub fields: Vec<String>,
    /// One entry per distinct key, in key order.
    pub rows: Vec<Vec<Value>>,
}

/// A data-changing step of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStep {
    /// Remove every target row.
    Truncate,
    /// Overwrite `set_fields` of target rows whose key is in the scratch table.
    UpdateExisting { set_fields: Vec<String> },
    /// Remove scratch rows whose key already exists in the target.
    DeleteScratchRowsInTarget,
    /// Copy scratch rows into the target, optionally only keys the target lacks.
    InsertNew { only_absent: bool },
}

impl fmt::Display for MergeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncate => f.write_str("truncate"),
            Self::UpdateExisting { .. } => f.write_str("update-existing"),
            Self::DeleteScratchRowsInTarget => f.write_str("delete-scratch-rows-already-in-target"),
            Self::InsertNew { only_absent: true } => f.write_str("insert-new (absent keys)"),
            Self::InsertNew { only_absent: false } => f.write_str("insert-new"),
        }
    }
}

/// One entry of a plan's full lifecycle, scratch handling included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'p> {
    CreateScratch,
    PopulateScratch,
    Step(&'p MergeStep),
    DropScratch,
}

impl fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateScratch => f.write_str("create-scratch"),
            Self::PopulateScratch => f.write_str("populate-scratch"),
            Self::Step(step) => fmt::Display::fmt(step, f),
            Self::DropScratch => f.write_str("drop-scratch"),
        }
    }
}

/// Deterministic, replay-safe application of one batch to one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub target: TargetTableSpec,
    /// `None` for a no-op plan.
    pub scratch: Option<ScratchTable>,
    pub steps: Vec<MergeStep>,
}

impl MergePlan {
    /// A plan that touches nothing.
    #[must_use]
    pub fn noop(target: TargetTableSpec) -> Self {
        Self {
            target,
            scratch: None,
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }

    /// Rows the plan carries.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.scratch.as_ref().map_or(0, |s| s.rows.len())
    }

    /// Every operation in execution order:
    /// create and populate the scratch table, the merge steps, drop it.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation<'_>> {
        if self.is_noop() {
            return Vec::new();
        }
        let mut ops = Vec::with_capacity(self.steps.len() + 3);
        ops.push(Operation::CreateScratch);
        ops.push(Operation::PopulateScratch);
        ops.extend(self.steps.iter().map(Operation::Step));
        ops.push(Operation::DropScratch);
        ops
    }
}

/// Build the merge plan for `resolved` into `spec`.
///
/// An empty batch yields a no-op plan in every mode, including
/// `insert_delete`: a run that extracted nothing never empties a table.
///
/// # Errors
///
/// Returns [`ConfigurationError`] when `spec` is inconsistent (empty name or
/// field list, missing key, key or update field outside the field list).
pub fn plan(
    spec: &TargetTableSpec,
    resolved: BTreeMap<KeyValue, StagedRow>,
) -> Result<MergePlan, ConfigurationError> {
    spec.validate()?;

    if resolved.is_empty() {
        tracing::debug!(table = %spec.name, "Empty batch, planning no-op");
        return Ok(MergePlan::noop(spec.clone()));
    }

    let rows = resolved
        .into_values()
        .map(|row| row.project(&spec.fields))
        .collect();
    let scratch = ScratchTable {
        name: format!("{}{SCRATCH_SUFFIX}", spec.name),
        fields: spec.fields.clone(),
        rows,
    };

    let steps = match spec.mode {
        InsertMode::Append => vec![MergeStep::InsertNew { only_absent: true }],
        InsertMode::InsertDelete => vec![
            MergeStep::Truncate,
            MergeStep::InsertNew { only_absent: false },
        ],
        InsertMode::AppendUpdate => vec![
            MergeStep::UpdateExisting {
                set_fields: spec.effective_update_fields(),
            },
            MergeStep::DeleteScratchRowsInTarget,
            MergeStep::InsertNew { only_absent: false },
        ],
    };

    Ok(MergePlan {
        target: spec.clone(),
        scratch: Some(scratch),
        steps,
    })
}
