//! `SQLite`-backed implementation of [`TargetStore`].
//!
//! Uses a single `Mutex<Connection>`; a transaction holds the lock from
//! `BEGIN` until `COMMIT`/`ROLLBACK`, so writers are strictly serialized.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use stagewise_types::Value;

use crate::error::{self, StoreError};
use crate::store::{QueryResult, Statement, StoreTransaction, TargetStore};

/// Longest SQL prefix quoted in error messages.
const SQL_PREVIEW_CHARS: usize = 96;

/// `SQLite` target store.
///
/// Create with [`SqliteTargetStore::open`] for a file-backed warehouse or
/// [`SqliteTargetStore::in_memory`] for tests.
pub struct SqliteTargetStore {
    conn: Mutex<Connection>,
}

impl SqliteTargetStore {
    /// Open or create a `SQLite` database at `path`.
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
        let conn = Connection::open(path).map_err(|e| StoreError::backend("open", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::backend("open_in_memory", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl TargetStore for SqliteTargetStore {
    fn begin(&self) -> error::Result<Box<dyn StoreTransaction + '_>> {
        let conn = self.lock_conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| StoreError::backend("begin transaction", e))?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }

    fn query(&self, statement: &Statement) -> error::Result<QueryResult> {
        let conn = self.lock_conn()?;
        query_on(&conn, statement)
    }
}

/// Open `SQLite` transaction; owns the connection lock until finished.
struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn execute(&mut self, statement: &Statement) -> error::Result<u64> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        execute_on(&self.conn, statement)
    }

    fn query(&mut self, statement: &Statement) -> error::Result<QueryResult> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        query_on(&self.conn, statement)
    }

    fn commit(mut self: Box<Self>) -> error::Result<()> {
        self.finished = true;
        if let Err(e) = self.conn.execute_batch("COMMIT") {
            // A failed COMMIT leaves the transaction open in SQLite.
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(StoreError::backend("commit", e));
        }
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> error::Result<()> {
        self.finished = true;
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| StoreError::backend("rollback", e))
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "rollback of abandoned transaction failed");
            }
        }
    }
}

fn preview(sql: &str) -> String {
    let flat = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > SQL_PREVIEW_CHARS {
        let cut: String = flat.chars().take(SQL_PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        flat
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Int(i),
        SqlValue::Real(f) => Value::Float(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

fn execute_on(conn: &Connection, statement: &Statement) -> error::Result<u64> {
    let params = rusqlite::params_from_iter(statement.params.iter().map(to_sql_value));
    let affected = conn
        .execute(&statement.sql, params)
        .map_err(|e| StoreError::backend(format!("execute `{}`", preview(&statement.sql)), e))?;
    Ok(affected as u64)
}

fn query_on(conn: &Connection, statement: &Statement) -> error::Result<QueryResult> {
    let context = || format!("query `{}`", preview(&statement.sql));
    let mut prepared = conn
        .prepare(&statement.sql)
        .map_err(|e| StoreError::backend(context(), e))?;
    if !prepared.readonly() {
        return Err(StoreError::NotReadOnly(preview(&statement.sql)));
    }
    let columns: Vec<String> = prepared
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();
    let width = columns.len();

    let params = rusqlite::params_from_iter(statement.params.iter().map(to_sql_value));
    let mut cursor = prepared
        .query(params)
        .map_err(|e| StoreError::backend(context(), e))?;
    let mut rows = Vec::new();
    while let Some(row) = cursor.next().map_err(|e| StoreError::backend(context(), e))? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            let raw: SqlValue = row.get(idx).map_err(|e| StoreError::backend(context(), e))?;
            values.push(from_sql_value(raw));
        }
        rows.push(values);
    }
    Ok(QueryResult { columns, rows })
}
