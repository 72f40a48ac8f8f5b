//! The three stage kinds and their single-attempt execution.
//!
//! A stage runs synchronously against the shared store and never retries;
//! the coordinator owns retries, timeouts and skip propagation.

use std::fmt;
use std::time::Instant;

use stagewise_store::{StoreError, TargetStore};
use stagewise_types::{
    CheckDefinition, StageError, StageName, StageResult, TargetTableSpec, TieBreakRule, TimeRange,
    Value,
};

use crate::dedupe::dedupe;
use crate::executor;
use crate::plan::plan;
use crate::quality;
use crate::render;
use crate::shape::{RowShape, RowShaper};
use crate::source::RowSource;

/// Land one source locator into a staging table.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingStage {
    pub name: StageName,
    pub table: String,
    /// Staging columns; source fields outside this list are dropped.
    pub fields: Vec<String>,
    pub locator: String,
}

/// Merge a staging table into a dimension or fact table.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadStage {
    pub name: StageName,
    pub staging_table: String,
    pub shape: RowShape,
    pub target: TargetTableSpec,
    pub tie_break: TieBreakRule,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityGateStage {
    pub name: StageName,
    pub checks: Vec<CheckDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Staging(StagingStage),
    Load(LoadStage),
    QualityGate(QualityGateStage),
}

/// What a stage attempt may touch.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub store: &'a dyn TargetStore,
    pub source: &'a dyn RowSource,
    pub window: TimeRange,
    /// Set when the stage runs under a timeout.
    pub deadline: Option<Instant>,
}

impl fmt::Debug for StageContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("window", &self.window)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Stage {
    #[must_use]
    pub fn name(&self) -> &StageName {
        match self {
            Self::Staging(s) => &s.name,
            Self::Load(s) => &s.name,
            Self::QualityGate(s) => &s.name,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Staging(_) => "staging",
            Self::Load(_) => "load",
            Self::QualityGate(_) => "quality_gate",
        }
    }

    /// Run one attempt.
    ///
    /// # Errors
    ///
    /// Returns the categorized [`StageError`] that ended the attempt.
    pub fn run(&self, ctx: &StageContext<'_>) -> Result<StageResult, StageError> {
        match self {
            Self::Staging(stage) => stage.run(ctx),
            Self::Load(stage) => stage.run(ctx),
            Self::QualityGate(stage) => stage.run(ctx),
        }
    }
}

impl StagingStage {
    fn run(&self, ctx: &StageContext<'_>) -> Result<StageResult, StageError> {
        let rows: Vec<Vec<Value>> = ctx
            .source
            .fetch(&ctx.window, &self.locator)?
            .map(|row| row.map(|row| row.project(&self.fields)))
            .collect::<Result<_, _>>()?;

        let table = self.table.as_str();
        let store_err = |what: &str, e: &StoreError| {
            StageError::transaction(format!("landing into '{table}' failed to {what}: {e}"))
        };

        let mut tx = ctx.store.begin().map_err(|e| store_err("begin transaction", &e))?;
        tx.execute(&render::clear_table(table))
            .map_err(|e| store_err("clear staging table", &e))?;
        for stmt in render::insert_rows(table, &self.fields, &rows) {
            tx.execute(&stmt).map_err(|e| store_err("insert rows", &e))?;
        }
        if ctx.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StageError::transaction(format!(
                "landing into '{table}' passed its deadline before commit"
            )));
        }
        tx.commit().map_err(|e| store_err("commit", &e))?;

        let landed = rows.len() as u64;
        tracing::info!(stage = %self.name, table, locator = self.locator, rows = landed, "Landed batch");
        Ok(StageResult::succeeded(format!("staged {landed} rows"), landed))
    }
}

impl LoadStage {
    fn run(&self, ctx: &StageContext<'_>) -> Result<StageResult, StageError> {
        let staged = ctx
            .store
            .query(&render::select_rows(&self.staging_table, &self.shape.filters))
            .map_err(|e| {
                StageError::transaction(format!(
                    "reading staging table '{}': {e}",
                    self.staging_table
                ))
            })?
            .into_staged_rows();
        let read = staged.len();

        let shaper = RowShaper::prepare(&self.shape, ctx.store)?;
        let shaped = staged.into_iter().map(|row| shaper.apply(row, &self.target));
        let resolved = dedupe(shaped, &self.target.key(), &self.tie_break);
        if resolved.skipped > 0 {
            tracing::warn!(
                stage = %self.name,
                table = self.target.name,
                skipped = resolved.skipped,
                "Dropped rows without a complete key"
            );
        }

        let plan = plan(&self.target, resolved.rows)?;
        let summary = executor::apply(&plan, ctx.store, ctx.deadline)?;
        tracing::info!(
            stage = %self.name,
            table = self.target.name,
            read,
            merged = plan.row_count(),
            affected = summary.rows_affected(),
            "Load complete"
        );
        Ok(StageResult::succeeded(summary.to_string(), summary.rows_affected()))
    }
}

impl QualityGateStage {
    fn run(&self, ctx: &StageContext<'_>) -> Result<StageResult, StageError> {
        quality::run(&self.checks, ctx.store).into_stage_result()
    }
}
