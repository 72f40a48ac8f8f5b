//! Target store contract.
//!
//! The load engine is store-agnostic: any relational store that supports
//! transactions and temporary tables can sit behind [`TargetStore`].
//! Statements arrive fully rendered in the store's dialect.

use stagewise_types::{StagedRow, Value};

use crate::error;

/// A rendered statement with positional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Rows returned by a query, column names in select order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    /// First column of the first row, if the query returned any row.
    #[must_use]
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }

    /// Re-key every row by column name.
    #[must_use]
    pub fn into_staged_rows(self) -> Vec<StagedRow> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect()
    }
}

/// Storage contract for target and staging tables.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn TargetStore>`.
/// At most one transaction is in flight per store: [`begin`](Self::begin)
/// blocks until the previous transaction commits or rolls back, which is what
/// keeps concurrent merges into one table from interleaving.
pub trait TargetStore: Send + Sync {
    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) if the transaction
    /// cannot be started.
    fn begin(&self) -> error::Result<Box<dyn StoreTransaction + '_>>;

    /// Run a read-only query outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure,
    /// or `NotReadOnly` when the statement would write.
    fn query(&self, statement: &Statement) -> error::Result<QueryResult>;
}

/// One open unit of work.
///
/// Dropping a transaction that was neither committed nor rolled back rolls
/// it back.
pub trait StoreTransaction {
    /// Execute a statement, returning the number of rows affected.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn execute(&mut self, statement: &Statement) -> error::Result<u64>;

    /// Run a query inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure,
    /// or `NotReadOnly` when the statement would write.
    fn query(&mut self, statement: &Statement) -> error::Result<QueryResult>;

    /// Make every change in the transaction visible.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) if the commit fails;
    /// the transaction is rolled back in that case.
    fn commit(self: Box<Self>) -> error::Result<()>;

    /// Discard every change in the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) on storage failure.
    fn rollback(self: Box<Self>) -> error::Result<()>;
}
