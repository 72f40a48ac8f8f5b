//! Integration tests for the Sparkify fixture pipeline.
//!
//! These run the full path from YAML parsing through validation, staging
//! from JSON-lines files, dimension and fact merges, and the quality gate,
//! against an in-memory `SQLite` target store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use stagewise_engine::config::parser;
use stagewise_engine::config::types::{PipelineConfig, StageKind};
use stagewise_engine::config::validator;
use stagewise_engine::{run_pipeline_with, JsonLinesSource, RunOptions, RunReport};
use stagewise_store::{SqliteTargetStore, Statement, TargetStore};
use stagewise_types::{RunOutcome, StageStatus, TimeRange, Value};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests/fixtures")
}

fn sparkify() -> PipelineConfig {
    let path = fixtures().join("pipelines/sparkify.yaml");
    let mut config = parser::parse_pipeline(&path).expect("Failed to parse fixture pipeline");
    config.policy.retries = 0;
    config
}

fn day(d: u32) -> TimeRange {
    TimeRange::day(NaiveDate::from_ymd_opt(2018, 11, d).unwrap())
}

async fn run(config: &PipelineConfig, store: &Arc<SqliteTargetStore>, window: TimeRange) -> RunReport {
    let options = RunOptions {
        window: Some(window),
        record_history: false,
        ..RunOptions::default()
    };
    let source = Arc::new(JsonLinesSource::new(fixtures().join("data")));
    run_pipeline_with(config, &options, store.clone(), source, None)
        .await
        .expect("pipeline must start")
}

fn query(store: &SqliteTargetStore, sql: &str) -> Vec<Vec<Value>> {
    store.query(&Statement::new(sql)).unwrap().rows
}

fn count(store: &SqliteTargetStore, table: &str) -> i64 {
    query(store, &format!("SELECT COUNT(*) FROM \"{table}\""))[0][0]
        .as_i64()
        .unwrap()
}

#[test]
fn test_parse_and_validate_fixture_pipeline() {
    let config = sparkify();

    assert_eq!(config.pipeline, "sparkify");
    assert_eq!(config.stages.len(), 8);
    assert_eq!(config.stages[0].kind(), StageKind::Staging);
    assert_eq!(config.stage("load_songplays").unwrap().kind(), StageKind::LoadFact);
    assert_eq!(
        config.stage("load_songplays").unwrap().depends_on(),
        ["load_users", "load_time", "load_songs"]
    );

    validator::validate_pipeline(&config).expect("Validation should pass");
    assert!(validator::pipeline_warnings(&config).is_empty());
}

#[test]
fn test_parse_invalid_fixture() {
    let result = parser::parse_pipeline(&fixtures().join("pipelines/invalid_pipeline.yaml"));
    let err = format!("{:#}", result.unwrap_err());
    assert!(
        err.contains("unknown variant") && err.contains("upsert_everything"),
        "Expected serde enum parse error, got: {err}"
    );
}

#[tokio::test]
async fn test_sparkify_day_loads_star_schema() {
    let config = sparkify();
    let store = Arc::new(SqliteTargetStore::in_memory().unwrap());

    let report = run(&config, &store, day(15)).await;
    assert_eq!(report.outcome, RunOutcome::Succeeded, "{:?}", report.stages);
    assert_eq!(report.succeeded(), 8);

    assert_eq!(count(&store, "staging_events"), 4);
    assert_eq!(count(&store, "staging_songs"), 3);
    assert_eq!(report.stage("stage_events").unwrap().rows_affected, 4);

    // Two NextSong users; user 26 was promoted later in the day.
    assert_eq!(
        query(&store, "SELECT user_id, first_name, level FROM users ORDER BY user_id"),
        vec![
            vec![Value::from("26"), Value::from("Ryan"), Value::from("paid")],
            vec![Value::from("80"), Value::from("Tegan"), Value::from("paid")],
        ]
    );

    // Shortest label wins among duplicate songs and artists.
    assert_eq!(
        query(&store, "SELECT title FROM songs ORDER BY title"),
        vec![vec![Value::from("Intro")], vec![Value::from("Sehr kosmisch")]]
    );
    assert_eq!(
        query(&store, "SELECT name FROM artists ORDER BY name"),
        vec![vec![Value::from("Harmonia")], vec![Value::from("The XX")]]
    );

    assert_eq!(
        query(
            &store,
            "SELECT start_time, hour, day, week, month, year, weekday FROM \"time\" ORDER BY start_time LIMIT 1"
        ),
        vec![vec![
            Value::from("2018-11-15 00:30:00.000"),
            Value::Int(0),
            Value::Int(15),
            Value::Int(46),
            Value::Int(11),
            Value::Int(2018),
            Value::Int(5),
        ]]
    );
    assert_eq!(count(&store, "time"), 3);

    // Lookups match after trimming, case folding and truncating durations.
    assert_eq!(count(&store, "songplays"), 3);
    assert_eq!(
        query(
            &store,
            "SELECT song_id, artist_id FROM songplays WHERE song_id IS NOT NULL ORDER BY start_time"
        ),
        vec![
            vec![Value::from("SOZCTXZ12AB0182364"), Value::from("ARHARM1187B9AE0D3")],
            vec![Value::from("SOBZCIN12A8C13C1E9"), Value::from("ARXX0001187FB5A1C9")],
        ]
    );
}

#[tokio::test]
async fn test_rerunning_a_window_changes_nothing() {
    let config = sparkify();
    let store = Arc::new(SqliteTargetStore::in_memory().unwrap());
    let tables = ["users", "time", "artists", "songs", "songplays"];

    let first = run(&config, &store, day(15)).await;
    assert!(first.is_success());
    let snapshot: Vec<Vec<Vec<Value>>> = tables
        .iter()
        .map(|t| query(&store, &format!("SELECT * FROM \"{t}\" ORDER BY 1")))
        .collect();

    let second = run(&config, &store, day(15)).await;
    assert!(second.is_success(), "{:?}", second.stages);
    for (table, before) in tables.iter().zip(&snapshot) {
        let after = query(&store, &format!("SELECT * FROM \"{table}\" ORDER BY 1"));
        assert_eq!(&after, before, "table {table} changed on replay");
    }
    // Append loads found every key already present.
    assert_eq!(second.stage("load_songplays").unwrap().rows_affected, 0);
}

#[tokio::test]
async fn test_missing_partition_fails_dependents_only() {
    let config = sparkify();
    let store = Arc::new(SqliteTargetStore::in_memory().unwrap());

    let report = run(&config, &store, day(16)).await;

    let status = |name: &str| report.stage(name).unwrap().status;
    assert_eq!(status("stage_events"), StageStatus::Failed);
    for skipped in ["load_users", "load_time", "load_songplays", "run_quality_checks"] {
        assert_eq!(status(skipped), StageStatus::Skipped, "{skipped}");
    }
    for independent in ["stage_songs", "load_artists", "load_songs"] {
        assert_eq!(status(independent), StageStatus::Succeeded, "{independent}");
    }
    assert!(matches!(
        &report.outcome,
        RunOutcome::Failed { stage, .. } if stage.as_str() == "stage_events"
    ));
    assert_eq!(count(&store, "songs"), 2);
    assert_eq!(count(&store, "songplays"), 0);
}
