//! Target store and run history persistence for stagewise.
//!
//! Provides the [`TargetStore`] / [`StoreTransaction`] contract the load
//! engine mutates target tables through, a [`SqliteTargetStore`]
//! implementation, and [`RunHistory`] for recording runs and stage outcomes.

#![warn(clippy::pedantic)]

pub mod error;
pub mod history;
pub mod sqlite;
pub mod store;

pub use error::StoreError;
pub use history::{RunHistory, RunRecord, SqliteRunHistory, StageRecord};
pub use sqlite::SqliteTargetStore;
pub use store::{QueryResult, Statement, StoreTransaction, TargetStore};
