//! Shared model types for the stagewise load pipeline.
//!
//! Rows, keys, target table descriptors, quality checks, stage outcomes and
//! the categorized error model live here so the store, engine and CLI crates
//! can share them without circular dependencies.

#![warn(clippy::pedantic)]

pub mod error;
pub mod quality;
pub mod state;
pub mod table;
pub mod value;
pub mod window;

pub use error::{ConfigurationError, ErrorCategory, StageError};
pub use quality::{CheckDefinition, CheckId, QualityCheck};
pub use state::{PipelineId, RunId, RunOutcome, StageName, StageResult, StageStatus};
pub use table::{InsertMode, KeySpec, TargetTableSpec, TieBreakRule};
pub use value::{KeyValue, StagedRow, Value};
pub use window::TimeRange;
