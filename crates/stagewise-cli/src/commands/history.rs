use std::path::Path;

use anyhow::{Context, Result};

use stagewise_engine::config::parser;
use stagewise_engine::orchestrator;
use stagewise_types::PipelineId;

/// Execute the `history` command: list recent runs and their stage outcomes.
pub fn execute(pipeline_path: &Path, limit: usize) -> Result<()> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    let history = orchestrator::open_run_history(&config, pipeline_path.parent())?;
    let pipeline = PipelineId::new(config.pipeline.clone());
    let runs = history
        .recent_runs(&pipeline, limit)
        .context("Failed to read run history")?;

    if runs.is_empty() {
        println!("No runs recorded for pipeline '{pipeline}'.");
        return Ok(());
    }

    for run in runs {
        println!(
            "Run {} [{}] window {} .. {} started {}{}",
            run.id,
            run.status,
            run.window_start,
            run.window_end,
            run.started_at,
            run.finished_at
                .as_deref()
                .map(|t| format!(", finished {t}"))
                .unwrap_or_default()
        );
        if let Some(summary) = &run.summary {
            println!("  {summary}");
        }
        let stages = history
            .stage_outcomes(run.id)
            .with_context(|| format!("Failed to read stages of run {}", run.id))?;
        for stage in stages {
            let category = stage
                .error_category
                .as_deref()
                .map(|c| format!(" [{c}]"))
                .unwrap_or_default();
            println!(
                "  {:24} {:9} attempts={} rows={}{category}  {}",
                stage.stage, stage.status, stage.attempts, stage.rows_affected, stage.reason
            );
        }
    }
    Ok(())
}
