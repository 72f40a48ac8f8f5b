//! Turn a validated pipeline config into runnable parts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use stagewise_store::{RunHistory, SqliteRunHistory, SqliteTargetStore, TargetStore};
use stagewise_types::StageName;

use crate::config::types::{PipelineConfig, PolicyConfig, StageConfig};
use crate::coordinator::StageNode;
use crate::errors::RetryPolicy;
use crate::stage::{LoadStage, QualityGateStage, Stage, StagingStage};

/// `store.path` value selecting a throwaway in-memory target store.
pub const IN_MEMORY_STORE: &str = ":memory:";

fn stagewise_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".stagewise")
}

fn default_state_path() -> PathBuf {
    stagewise_home().join("state.db")
}

fn default_store_path(pipeline: &str) -> PathBuf {
    let file: String = pipeline
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    stagewise_home().join("warehouse").join(format!("{file}.db"))
}

/// Relative paths resolve against `base` (the pipeline file's directory).
fn relative_to(path: &Path, base: Option<&Path>) -> PathBuf {
    match base {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

/// Target store file, or `None` for an in-memory store.
pub(crate) fn target_store_path(config: &PipelineConfig, base: Option<&Path>) -> Option<PathBuf> {
    match &config.store.path {
        Some(path) if path.as_os_str() == IN_MEMORY_STORE => None,
        Some(path) => Some(relative_to(path, base)),
        None => Some(default_store_path(&config.pipeline)),
    }
}

pub(crate) fn create_target_store(
    config: &PipelineConfig,
    base: Option<&Path>,
) -> Result<Arc<dyn TargetStore>> {
    let store = match target_store_path(config, base) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Opening target store");
            SqliteTargetStore::open(&path)
                .with_context(|| format!("Failed to open target store {}", path.display()))?
        }
        None => {
            tracing::warn!("Target store is in-memory; loaded tables are discarded after the run");
            SqliteTargetStore::in_memory().context("Failed to open in-memory target store")?
        }
    };
    Ok(Arc::new(store) as Arc<dyn TargetStore>)
}

pub(crate) fn state_path(config: &PipelineConfig, base: Option<&Path>) -> PathBuf {
    config
        .state
        .path
        .as_deref()
        .map_or_else(default_state_path, |path| relative_to(path, base))
}

pub(crate) fn create_run_history(
    config: &PipelineConfig,
    base: Option<&Path>,
) -> Result<Arc<dyn RunHistory>> {
    let path = state_path(config, base);
    let history = SqliteRunHistory::open(&path)
        .with_context(|| format!("Failed to open state DB {}", path.display()))?;
    Ok(Arc::new(history) as Arc<dyn RunHistory>)
}

pub(crate) fn check_target_store(config: &PipelineConfig, base: Option<&Path>) -> bool {
    match create_target_store(config, base) {
        Ok(_) => {
            tracing::info!("Target store: OK");
            true
        }
        Err(e) => {
            tracing::error!("Target store: FAILED: {e:#}");
            false
        }
    }
}

pub(crate) fn check_run_history(config: &PipelineConfig, base: Option<&Path>) -> bool {
    match create_run_history(config, base) {
        Ok(_) => {
            tracing::info!("State backend: OK");
            true
        }
        Err(e) => {
            tracing::error!("State backend: FAILED: {e:#}");
            false
        }
    }
}

pub(crate) fn source_root(config: &PipelineConfig, base: Option<&Path>) -> PathBuf {
    relative_to(&config.source.root, base)
}

fn retry_policy(policy: &PolicyConfig) -> RetryPolicy {
    let base = RetryPolicy::no_retry().with_retries(
        policy.retries,
        Duration::from_secs(policy.retry_delay_seconds),
    );
    match policy.timeout_seconds {
        Some(secs) => base.with_timeout(Duration::from_secs(secs)),
        None => base,
    }
}

/// One coordinator node per configured stage, in declaration order.
#[must_use]
pub fn build_stages(config: &PipelineConfig) -> Vec<StageNode> {
    config
        .stages
        .iter()
        .map(|stage_config| {
            let name = StageName::new(stage_config.name());
            let stage = match stage_config {
                StageConfig::Staging(s) => Stage::Staging(StagingStage {
                    name,
                    table: s.table.clone(),
                    fields: s.fields.clone(),
                    locator: s.locator.clone(),
                }),
                StageConfig::LoadDimension(l) | StageConfig::LoadFact(l) => Stage::Load(LoadStage {
                    name,
                    staging_table: l.staging_table.clone(),
                    shape: l.shape(),
                    target: l.target.clone(),
                    tie_break: l.tie_break.clone(),
                }),
                StageConfig::QualityGate(g) => Stage::QualityGate(QualityGateStage {
                    name,
                    checks: g.checks.clone(),
                }),
            };
            let policy = retry_policy(&stage_config.policy().resolve(&config.policy));
            StageNode::new(stage)
                .depends_on(stage_config.depends_on().iter().map(String::as_str))
                .with_policy(policy)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    const YAML: &str = r#"
version: "1.0"
pipeline: resolve_test
policy:
  retries: 2
  retry_delay_seconds: 7
stages:
  - name: stage_songs
    kind: staging
    table: staging_songs
    locator: song_data
    fields: [song_id]
  - name: load_songs
    kind: load_dimension
    depends_on: [stage_songs]
    policy: { retries: 0, timeout_seconds: 30 }
    staging_table: staging_songs
    target: { name: songs, fields: [song_id], primary_key: [song_id], mode: append }
"#;

    #[test]
    fn stages_carry_resolved_policy() {
        let config = parse_pipeline_str(YAML).unwrap();
        let nodes = build_stages(&config);
        assert_eq!(nodes.len(), 2);

        assert_eq!(nodes[0].policy.retries, 2);
        assert_eq!(nodes[0].policy.delay, Duration::from_secs(7));
        assert!(nodes[0].policy.timeout.is_none());
        assert!(matches!(*nodes[0].stage, Stage::Staging(_)));

        assert_eq!(nodes[1].policy.retries, 0);
        assert_eq!(nodes[1].policy.timeout, Some(Duration::from_secs(30)));
        assert_eq!(nodes[1].depends_on, vec![StageName::new("stage_songs")]);
        assert_eq!(nodes[1].stage.kind(), "load");
    }

    #[test]
    fn relative_source_root_follows_pipeline_file() {
        let config = parse_pipeline_str(YAML).unwrap();
        assert_eq!(
            source_root(&config, Some(Path::new("/etc/pipelines"))),
            Path::new("/etc/pipelines/.")
        );
        assert_eq!(source_root(&config, None), Path::new("."));
    }

    #[test]
    fn file_backed_store_and_history_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = parse_pipeline_str(YAML).unwrap();
        config.store.path = Some(dir.path().join("target.db"));
        config.state.path = Some(dir.path().join("state").join("state.db"));
        assert!(check_target_store(&config, None));
        assert!(check_run_history(&config, None));
        assert!(dir.path().join("state").join("state.db").exists());
    }

    #[test]
    fn store_and_state_paths_follow_pipeline_file() {
        let mut config = parse_pipeline_str(YAML).unwrap();
        let base = Path::new("/etc/pipelines");
        config.store.path = Some(PathBuf::from("warehouse/sparkify.db"));
        config.state.path = Some(PathBuf::from("state.db"));
        assert_eq!(
            target_store_path(&config, Some(base)),
            Some(PathBuf::from("/etc/pipelines/warehouse/sparkify.db"))
        );
        assert_eq!(state_path(&config, Some(base)), base.join("state.db"));

        config.store.path = Some(PathBuf::from("/var/lib/warehouse.db"));
        assert_eq!(
            target_store_path(&config, Some(base)),
            Some(PathBuf::from("/var/lib/warehouse.db"))
        );
    }

    #[test]
    fn unset_store_path_is_persistent_not_in_memory() {
        let mut config = parse_pipeline_str(YAML).unwrap();
        let path = target_store_path(&config, None).unwrap();
        assert!(path.ends_with(".stagewise/warehouse/resolve_test.db"), "{}", path.display());

        config.store.path = Some(PathBuf::from(IN_MEMORY_STORE));
        assert_eq!(target_store_path(&config, Some(Path::new("/etc"))), None);
    }
}
