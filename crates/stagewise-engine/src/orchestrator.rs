//! Pipeline orchestrator: opens the store and history, provisions tables,
//! builds the stage graph and hands it to the coordinator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use stagewise_store::{RunHistory, TargetStore};
use stagewise_types::{ConfigurationError, PipelineId, TimeRange};
use tokio_util::sync::CancellationToken;

use crate::config::types::PipelineConfig;
use crate::config::validator::{pipeline_warnings, validate_pipeline};
use crate::coordinator::Coordinator;
use crate::errors::PipelineError;
use crate::provision::provision_tables;
use crate::resolve::{
    build_stages, check_run_history, check_target_store, create_run_history, create_target_store,
    source_root,
};
use crate::result::{CheckResult, RunReport};
use crate::source::{JsonLinesSource, RowSource};

/// Runtime options that are not part of the pipeline YAML.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Window to process; the previous UTC day when unset.
    pub window: Option<TimeRange>,
    /// Directory relative source, store and state paths resolve against.
    pub base_dir: Option<PathBuf>,
    /// Record the run in the state database.
    pub record_history: bool,
    pub cancel: Option<CancellationToken>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            window: None,
            base_dir: None,
            record_history: true,
            cancel: None,
        }
    }
}

impl RunOptions {
    fn resolved_window(&self) -> TimeRange {
        self.window.unwrap_or_else(|| TimeRange::previous_day(Utc::now()))
    }
}

fn validated(config: &PipelineConfig) -> Result<(), PipelineError> {
    validate_pipeline(config)
        .map_err(|e| PipelineError::Configuration(ConfigurationError::new(format!("{e:#}"))))?;
    for warning in pipeline_warnings(config) {
        tracing::warn!(pipeline = config.pipeline, "{warning}");
    }
    Ok(())
}

/// Run a pipeline against the store, source and history its config names.
///
/// Stage failures do not make this return `Err`: they are reported in the
/// [`RunReport`]. Only problems that stop the run from starting do.
///
/// # Errors
///
/// Returns a `PipelineError` if the config is invalid or the store,
/// history or tables cannot be set up.
pub async fn run_pipeline(
    config: &PipelineConfig,
    options: &RunOptions,
) -> Result<RunReport, PipelineError> {
    validated(config)?;
    let base = options.base_dir.as_deref();
    let store = create_target_store(config, base)?;
    let history = if options.record_history {
        Some(create_run_history(config, base)?)
    } else {
        None
    };
    let root = source_root(config, base);
    tracing::debug!(root = %root.display(), "Using JSON-lines source");
    let source: Arc<dyn RowSource> = Arc::new(JsonLinesSource::new(root));
    run_validated(config, options, store, source, history).await
}

/// Run a pipeline against caller-supplied collaborators.
///
/// # Errors
///
/// Same as [`run_pipeline`].
pub async fn run_pipeline_with(
    config: &PipelineConfig,
    options: &RunOptions,
    store: Arc<dyn TargetStore>,
    source: Arc<dyn RowSource>,
    history: Option<Arc<dyn RunHistory>>,
) -> Result<RunReport, PipelineError> {
    validated(config)?;
    run_validated(config, options, store, source, history).await
}

async fn run_validated(
    config: &PipelineConfig,
    options: &RunOptions,
    store: Arc<dyn TargetStore>,
    source: Arc<dyn RowSource>,
    history: Option<Arc<dyn RunHistory>>,
) -> Result<RunReport, PipelineError> {
    let config_for_provision = config.clone();
    let store_for_provision = Arc::clone(&store);
    tokio::task::spawn_blocking(move || {
        provision_tables(&config_for_provision, store_for_provision.as_ref())
    })
    .await
    .map_err(|e| PipelineError::Infrastructure(anyhow::anyhow!("provision task panicked: {e}")))??;

    let mut coordinator = Coordinator::new(
        PipelineId::new(config.pipeline.clone()),
        build_stages(config),
        store,
        source,
    )?;
    if let Some(history) = history {
        coordinator = coordinator.with_history(history);
    }
    if let Some(token) = &options.cancel {
        coordinator = coordinator.with_cancellation(token.clone());
    }

    Ok(coordinator.run(options.resolved_window()).await)
}

/// Check a pipeline: validate configuration and open the store and state
/// database without running anything. Relative paths resolve against
/// `base_dir`.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn check_pipeline(config: &PipelineConfig, base_dir: Option<&Path>) -> Result<CheckResult> {
    tracing::info!(pipeline = config.pipeline, "Checking pipeline configuration");
    validate_pipeline(config)?;

    Ok(CheckResult {
        stage_count: config.stages.len(),
        warnings: pipeline_warnings(config),
        store_ok: check_target_store(config, base_dir),
        state_ok: check_run_history(config, base_dir),
    })
}

/// Open the state database the pipeline records its runs in.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or created.
pub fn open_run_history(
    config: &PipelineConfig,
    base_dir: Option<&Path>,
) -> Result<Arc<dyn RunHistory>> {
    create_run_history(config, base_dir)
}

#[cfg(test)]
mod tests {
    use stagewise_store::{SqliteRunHistory, SqliteTargetStore};
    use stagewise_types::StagedRow;

    use super::*;
    use crate::config::parser::parse_pipeline_str;
    use crate::source::StaticRowSource;

    const YAML: &str = r#"
version: "1.0"
pipeline: orchestrator_test
policy: { retries: 0 }
stages:
  - name: stage_songs
    kind: staging
    table: staging_songs
    locator: song_data
    fields: [song_id, title]
  - name: load_songs
    kind: load_dimension
    depends_on: [stage_songs]
    staging_table: staging_songs
    target: { name: songs, fields: [song_id, title], primary_key: [song_id], mode: append }
  - name: checks
    kind: quality_gate
    depends_on: [load_songs]
    checks:
      - { type: row_count, table: songs }
"#;

    fn source() -> Arc<dyn RowSource> {
        Arc::new(StaticRowSource::new().with_rows(
            "song_data",
            vec![StagedRow::new().with("song_id", "S1").with("title", "Intro")],
        ))
    }

    #[tokio::test]
    async fn provisions_and_runs_every_stage() {
        let config = parse_pipeline_str(YAML).unwrap();
        let history = Arc::new(SqliteRunHistory::in_memory().unwrap());
        let report = run_pipeline_with(
            &config,
            &RunOptions::default(),
            Arc::new(SqliteTargetStore::in_memory().unwrap()),
            source(),
            Some(history.clone()),
        )
        .await
        .unwrap();
        assert!(report.is_success(), "{:?}", report.stages);
        assert_eq!(report.stages.len(), 3);
        assert_eq!(report.window.end - report.window.start, chrono::Duration::days(1));
        assert!(report.run_id.is_some());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_running() {
        let config = parse_pipeline_str(&YAML.replace("[load_songs]", "[nope]")).unwrap();
        let err = run_pipeline_with(
            &config,
            &RunOptions::default(),
            Arc::new(SqliteTargetStore::in_memory().unwrap()),
            source(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert!(err.to_string().contains("unknown stage 'nope'"));
    }

    #[tokio::test]
    async fn file_backed_run_uses_configured_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data/song_data")).unwrap();
        std::fs::write(
            dir.path().join("data/song_data/a.json"),
            "{\"song_id\": \"S1\", \"title\": \"Intro\"}\n",
        )
        .unwrap();
        let mut config = parse_pipeline_str(YAML).unwrap();
        config.store.path = Some(PathBuf::from("target.db"));
        config.state.path = Some(PathBuf::from("state.db"));
        config.source.root = PathBuf::from("data");

        let options = RunOptions {
            base_dir: Some(dir.path().to_path_buf()),
            ..RunOptions::default()
        };
        let report = run_pipeline(&config, &options).await.unwrap();
        assert!(report.is_success(), "{:?}", report.stages);
        assert_eq!(report.stage("load_songs").unwrap().rows_affected, 1);

        assert!(dir.path().join("target.db").exists());
        let history = SqliteRunHistory::open(&dir.path().join("state.db")).unwrap();
        let runs = history
            .recent_runs(&PipelineId::new("orchestrator_test"), 10)
            .unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[test]
    fn check_reports_warnings() {
        let yaml = YAML.replace(
            "      - { type: row_count, table: songs }",
            "      - { type: row_count, table: songs }\n      - { type: sometimes }",
        );
        let mut config = parse_pipeline_str(&yaml).unwrap();
        let dir = tempfile::tempdir().unwrap();
        config.store.path = Some(PathBuf::from("target.db"));
        config.state.path = Some(PathBuf::from("state.db"));
        let result = check_pipeline(&config, Some(dir.path())).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.stage_count, 3);
        assert_eq!(result.warnings.len(), 1);
        assert!(dir.path().join("target.db").exists());
        assert!(dir.path().join("state.db").exists());
    }

    /// Shared in-memory sink for formatted log output.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn config_warnings_are_logged_once_per_run() {
        let logs = LogBuffer::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let yaml = YAML.replace(
            "      - { type: row_count, table: songs }",
            "      - { type: row_count, table: songs }\n      - { type: sometimes }",
        );
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("song_data")).unwrap();
        std::fs::write(
            dir.path().join("song_data/a.json"),
            "{\"song_id\": \"S1\", \"title\": \"Intro\"}\n",
        )
        .unwrap();
        let mut config = parse_pipeline_str(&yaml).unwrap();
        config.store.path = Some(PathBuf::from("target.db"));
        config.state.path = Some(PathBuf::from("state.db"));
        let options = RunOptions {
            base_dir: Some(dir.path().to_path_buf()),
            ..RunOptions::default()
        };

        let report = run_pipeline(&config, &options).await.unwrap();
        assert!(report.is_success(), "{:?}", report.stages);

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output.matches("will be skipped").count(), 1, "{output}");
    }
}
