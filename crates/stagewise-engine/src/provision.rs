//! Create staging and target tables before the first stage runs.

use anyhow::{Context, Result};
use stagewise_store::TargetStore;

use crate::config::types::{PipelineConfig, StageConfig};
use crate::render;

/// Tables a pipeline writes: `(name, fields)`, staging tables first.
#[must_use]
pub fn declared_tables(config: &PipelineConfig) -> Vec<(&str, &[String])> {
    let staging = config.stages.iter().filter_map(|s| match s {
        StageConfig::Staging(st) => Some((st.table.as_str(), st.fields.as_slice())),
        _ => None,
    });
    let targets = config.stages.iter().filter_map(|s| match s {
        StageConfig::LoadDimension(l) | StageConfig::LoadFact(l) => {
            Some((l.target.name.as_str(), l.target.fields.as_slice()))
        }
        _ => None,
    });
    staging.chain(targets).collect()
}

/// Create every declared table that does not exist yet, in one transaction.
///
/// # Errors
///
/// Returns an error if any `CREATE TABLE` fails; nothing is created then.
pub fn provision_tables(config: &PipelineConfig, store: &dyn TargetStore) -> Result<usize> {
    let tables = declared_tables(config);
    let mut tx = store.begin().context("Failed to begin provisioning transaction")?;
    for (table, fields) in &tables {
        tx.execute(&render::create_table(table, fields))
            .with_context(|| format!("Failed to create table '{table}'"))?;
    }
    tx.commit().context("Failed to commit provisioned tables")?;
    tracing::debug!(pipeline = config.pipeline, tables = tables.len(), "Provisioned tables");
    Ok(tables.len())
}
