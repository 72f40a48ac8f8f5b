//! Run history persistence.
//!
//! Every pipeline run gets one `pipeline_runs` row and one `stage_runs` row
//! per stage that reached a terminal state.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDateTime, Utc};
use rusqlite::Connection;
use stagewise_types::{PipelineId, RunId, RunOutcome, StageName, StageResult, StageStatus, TimeRange};

use crate::error::{self, StoreError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for history tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    window_start TEXT NOT NULL,
    window_end TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    summary TEXT
);

CREATE TABLE IF NOT EXISTS stage_runs (
    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id),
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    reason TEXT NOT NULL,
    rows_affected INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    error_category TEXT,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (run_id, stage)
);

CREATE INDEX IF NOT EXISTS idx_pipeline_runs_pipeline ON pipeline_runs (pipeline, id);
";

/// One persisted run, as listed by [`RunHistory::recent_runs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: RunId,
    pub pipeline: String,
    pub window_start: String,
    pub window_end: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub summary: Option<String>,
}

/// One persisted stage outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: String,
    pub status: String,
    pub reason: String,
    pub rows_affected: u64,
    pub attempts: u32,
    pub error_category: Option<String>,
}

/// Storage contract for run history.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn RunHistory>`.
pub trait RunHistory: Send + Sync {
    /// Begin a new run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn start_run(&self, pipeline: &PipelineId, window: &TimeRange) -> error::Result<RunId>;

    /// Upsert the terminal outcome of one stage.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn record_stage(
        &self,
        run_id: RunId,
        stage: &StageName,
        result: &StageResult,
    ) -> error::Result<()>;

    /// Finalize a run with its overall outcome.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn complete_run(&self, run_id: RunId, outcome: &RunOutcome) -> error::Result<()>;

    /// Latest runs of `pipeline`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn recent_runs(&self, pipeline: &PipelineId, limit: usize) -> error::Result<Vec<RunRecord>>;

    /// Stage outcomes of one run, ordered by stage name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on storage failure.
    fn stage_outcomes(&self, run_id: RunId) -> error::Result<Vec<StageRecord>>;
}

/// `SQLite`-backed run history.
pub struct SqliteRunHistory {
    conn: Mutex<Connection>,
}

impl SqliteRunHistory {
    /// Open or create a history database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory can't be created,
    /// or [`StoreError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| StoreError::backend("open history", e))?;
        Self::init(conn)
    }

    /// Create an in-memory history (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the tables can't be created.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::backend("open history", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StoreError::backend("create history tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }
}

impl RunHistory for SqliteRunHistory {
    fn start_run(&self, pipeline: &PipelineId, window: &TimeRange) -> error::Result<RunId> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO pipeline_runs (pipeline, window_start, window_end, status, started_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                pipeline.as_str(),
                window.start.to_rfc3339(),
                window.end.to_rfc3339(),
                StageStatus::Running.as_str(),
                Self::now_sqlite(),
            ],
        )
        .map_err(|e| StoreError::backend("start_run", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn record_stage(
        &self,
        run_id: RunId,
        stage: &StageName,
        result: &StageResult,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let rows = i64::try_from(result.rows_affected).unwrap_or(i64::MAX);
        conn.execute(
            "INSERT INTO stage_runs \
             (run_id, stage, status, reason, rows_affected, attempts, error_category, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(run_id, stage) DO UPDATE SET \
             status = ?3, reason = ?4, rows_affected = ?5, attempts = ?6, \
             error_category = ?7, recorded_at = ?8",
            rusqlite::params![
                run_id,
                stage.as_str(),
                result.status.as_str(),
                result.reason,
                rows,
                result.attempts,
                result.error_category.map(|c| c.to_string()),
                Self::now_sqlite(),
            ],
        )
        .map_err(|e| StoreError::backend("record_stage", e))?;
        Ok(())
    }

    fn complete_run(&self, run_id: RunId, outcome: &RunOutcome) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let summary = match outcome {
            RunOutcome::Succeeded => None,
            other => Some(other.to_string()),
        };
        conn.execute(
            "UPDATE pipeline_runs SET status = ?1, finished_at = ?2, summary = ?3 WHERE id = ?4",
            rusqlite::params![outcome.as_str(), Self::now_sqlite(), summary, run_id],
        )
        .map_err(|e| StoreError::backend("complete_run", e))?;
        Ok(())
    }

    fn recent_runs(&self, pipeline: &PipelineId, limit: usize) -> error::Result<Vec<RunRecord>> {
        let conn = self.lock_conn()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn
            .prepare(
                "SELECT id, pipeline, window_start, window_end, status, started_at, \
                 finished_at, summary FROM pipeline_runs \
                 WHERE pipeline = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| StoreError::backend("recent_runs", e))?;
        let rows = stmt
            .query_map(rusqlite::params![pipeline.as_str(), limit], |row| {
                let started_at: String = row.get(5)?;
                let finished_at: Option<String> = row.get(6)?;
                Ok(RunRecord {
                    id: row.get(0)?,
                    pipeline: row.get(1)?,
                    window_start: row.get(2)?,
                    window_end: row.get(3)?,
                    status: row.get(4)?,
                    started_at: Self::sqlite_to_iso8601(&started_at),
                    finished_at: finished_at.as_deref().map(Self::sqlite_to_iso8601),
                    summary: row.get(7)?,
                })
            })
            .map_err(|e| StoreError::backend("recent_runs", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::backend("recent_runs", e))
    }

    fn stage_outcomes(&self, run_id: RunId) -> error::Result<Vec<StageRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT stage, status, reason, rows_affected, attempts, error_category \
                 FROM stage_runs WHERE run_id = ?1 ORDER BY stage",
            )
            .map_err(|e| StoreError::backend("stage_outcomes", e))?;
        let rows = stmt
            .query_map([run_id], |row| {
                let rows_affected: i64 = row.get(3)?;
                Ok(StageRecord {
                    stage: row.get(0)?,
                    status: row.get(1)?,
                    reason: row.get(2)?,
                    rows_affected: u64::try_from(rows_affected).unwrap_or_default(),
                    attempts: row.get(4)?,
                    error_category: row.get(5)?,
                })
            })
            .map_err(|e| StoreError::backend("stage_outcomes", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::backend("stage_outcomes", e))
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use stagewise_types::StageError;

    use super::*;

    fn pid(name: &str) -> PipelineId {
        PipelineId::new(name)
    }

    fn window() -> TimeRange {
        TimeRange::day(NaiveDate::from_ymd_opt(2018, 11, 1).unwrap())
    }

    #[test]
    fn run_lifecycle() {
        let history = SqliteRunHistory::in_memory().unwrap();
        let run_id = history.start_run(&pid("sparkify"), &window()).unwrap();

        let runs = history.recent_runs(&pid("sparkify"), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "running");
        assert!(runs[0].finished_at.is_none());
        assert!(runs[0].window_start.starts_with("2018-11-01T00:00:00"));

        history.complete_run(run_id, &RunOutcome::Succeeded).unwrap();
        let runs = history.recent_runs(&pid("sparkify"), 10).unwrap();
        assert_eq!(runs[0].status, "succeeded");
        assert!(runs[0].finished_at.as_deref().unwrap().ends_with('Z'));
        assert!(runs[0].summary.is_none());
    }

    #[test]
    fn failed_run_keeps_summary() {
        let history = SqliteRunHistory::in_memory().unwrap();
        let run_id = history.start_run(&pid("p"), &window()).unwrap();
        let outcome = RunOutcome::Failed {
            stage: StageName::new("stage_events"),
            reason: "source unavailable".into(),
        };
        history.complete_run(run_id, &outcome).unwrap();

        let run = &history.recent_runs(&pid("p"), 1).unwrap()[0];
        assert_eq!(run.status, "failed");
        assert_eq!(
            run.summary.as_deref(),
            Some("failed at 'stage_events': source unavailable")
        );
    }

    #[test]
    fn stage_outcome_upserts() {
        let history = SqliteRunHistory::in_memory().unwrap();
        let run_id = history.start_run(&pid("p"), &window()).unwrap();
        let stage = StageName::new("load_users");

        let failed = StageResult::failed(&StageError::transaction("locked")).with_attempts(1);
        history.record_stage(run_id, &stage, &failed).unwrap();
        let ok = StageResult::succeeded("merged 3 rows", 3).with_attempts(2);
        history.record_stage(run_id, &stage, &ok).unwrap();

        let outcomes = history.stage_outcomes(run_id).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, "succeeded");
        assert_eq!(outcomes[0].rows_affected, 3);
        assert_eq!(outcomes[0].attempts, 2);
        assert!(outcomes[0].error_category.is_none());
    }

    #[test]
    fn recent_runs_are_newest_first_and_limited() {
        let history = SqliteRunHistory::in_memory().unwrap();
        let first = history.start_run(&pid("p"), &window()).unwrap();
        let second = history.start_run(&pid("p"), &window()).unwrap();
        history.start_run(&pid("other"), &window()).unwrap();

        let runs = history.recent_runs(&pid("p"), 5).unwrap();
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(history.recent_runs(&pid("p"), 1).unwrap().len(), 1);
    }

    #[test]
    fn file_backed_history_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("history.db");
        {
            let history = SqliteRunHistory::open(&path).unwrap();
            history.start_run(&pid("p"), &window()).unwrap();
        }
        let history = SqliteRunHistory::open(&path).unwrap();
        assert_eq!(history.recent_runs(&pid("p"), 10).unwrap().len(), 1);
    }
}
