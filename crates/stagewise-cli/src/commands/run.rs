use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use stagewise_engine::config::parser;
use stagewise_engine::config::validator;
use stagewise_engine::{orchestrator, RunOptions, RunReport};
use stagewise_types::TimeRange;

/// Execute the `run` command: parse, validate, and run a pipeline.
pub async fn execute(
    pipeline_path: &Path,
    window_start: Option<&str>,
    window_end: Option<&str>,
) -> Result<()> {
    // 1. Parse pipeline YAML
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    // 2. Validate
    validator::validate_pipeline(&config)?;
    let window = parse_window(window_start, window_end)?;

    tracing::info!(
        pipeline = config.pipeline,
        stages = config.stages.len(),
        "Pipeline validated"
    );

    // 3. Run, cancelling on Ctrl-C
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let options = RunOptions {
        window,
        base_dir: pipeline_path.parent().map(Path::to_path_buf),
        cancel: Some(cancel),
        ..RunOptions::default()
    };
    let report = orchestrator::run_pipeline(&config, &options).await?;

    print_report(&report);

    if report.is_success() {
        Ok(())
    } else {
        anyhow::bail!("Pipeline '{}' {}", config.pipeline, report.outcome)
    }
}

fn print_report(report: &RunReport) {
    println!(
        "Pipeline '{}' {} for {}",
        report.pipeline,
        report.outcome.as_str(),
        report.window
    );
    for stage in &report.stages {
        let result = &stage.result;
        let attempts = if result.attempts > 1 {
            format!(" after {} attempts", result.attempts)
        } else {
            String::new()
        };
        println!(
            "  {:24} {:12} {:9}{attempts}  {}",
            stage.name.as_str(),
            stage.kind,
            result.status.as_str(),
            result.reason
        );
    }
    println!(
        "  Stages:          {} succeeded, {} failed, {} skipped",
        report.succeeded(),
        report.failed(),
        report.skipped()
    );
    if report.retry_count() > 0 {
        println!("  Retries:         {}", report.retry_count());
    }
    println!("  Duration:        {:.2}s", report.duration.as_secs_f64());
}

/// Window from `--window-start`/`--window-end`; `None` when neither is given.
fn parse_window(start: Option<&str>, end: Option<&str>) -> Result<Option<TimeRange>> {
    let Some(start) = start else {
        return Ok(None);
    };
    let start = parse_instant(start).context("Invalid --window-start")?;
    let end = match end {
        Some(end) => parse_instant(end).context("Invalid --window-end")?,
        None => start + Duration::days(1),
    };
    Ok(Some(TimeRange::new(start, end)?))
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(TimeRange::day(date).start);
    }
    let ts = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("'{raw}' is neither YYYY-MM-DD nor an RFC 3339 timestamp"))?;
    Ok(ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_means_default_window() {
        assert!(parse_window(None, None).unwrap().is_none());
    }

    #[test]
    fn date_start_covers_one_day() {
        let window = parse_window(Some("2018-11-15"), None).unwrap().unwrap();
        assert_eq!(
            window,
            TimeRange::day(NaiveDate::from_ymd_opt(2018, 11, 15).unwrap())
        );
    }

    #[test]
    fn rfc3339_bounds_are_normalized_to_utc() {
        let window = parse_window(Some("2018-11-15T02:00:00+02:00"), Some("2018-11-16"))
            .unwrap()
            .unwrap();
        assert_eq!(window.start.to_rfc3339(), "2018-11-15T00:00:00+00:00");
        assert_eq!(window.end.to_rfc3339(), "2018-11-16T00:00:00+00:00");
    }

    #[test]
    fn rejects_inverted_and_garbled_windows() {
        assert!(parse_window(Some("2018-11-15"), Some("2018-11-14")).is_err());
        let err = parse_window(Some("yesterday"), None).unwrap_err();
        assert!(format!("{err:#}").contains("neither YYYY-MM-DD"));
    }
}
