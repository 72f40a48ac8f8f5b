//! Store error types.

/// Errors produced by [`TargetStore`](crate::TargetStore) and
/// [`RunHistory`](crate::RunHistory) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `SQLite` failure with the operation that triggered it.
    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("store lock poisoned")]
    LockPoisoned,

    /// A query would modify the database.
    #[error("refusing to run `{0}` as a query: statement is not read-only")]
    NotReadOnly(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    TransactionFinished,
}

impl StoreError {
    pub(crate) fn backend(context: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Backend {
            context: context.into(),
            source,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StoreError>;
