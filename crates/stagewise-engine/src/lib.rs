//! Incremental load and merge engine for stagewise pipelines.
//!
//! A pipeline is a DAG of stages: staging stages copy a window of raw rows
//! into staging tables, load stages deduplicate, plan and merge them into
//! dimension and fact tables, and quality gates verify the result. The
//! [`Coordinator`] runs the graph with per-stage retries, timeouts and
//! failure propagation; [`run_pipeline`] wires it up from YAML config.

#![warn(clippy::pedantic)]

pub mod config;
pub mod coordinator;
pub mod dedupe;
pub mod errors;
pub mod executor;
pub mod orchestrator;
pub mod plan;
pub mod provision;
pub mod quality;
pub mod render;
pub(crate) mod resolve;
pub mod result;
pub mod shape;
pub mod source;
pub mod stage;

pub use coordinator::{Coordinator, StageNode};
pub use dedupe::{dedupe, Deduplicated};
pub use errors::{PipelineError, RetryPolicy};
pub use executor::LoadSummary;
pub use orchestrator::{
    check_pipeline, open_run_history, run_pipeline, run_pipeline_with, RunOptions,
};
pub use plan::{plan, MergePlan, MergeStep};
pub use quality::GateReport;
pub use resolve::build_stages;
pub use result::{CheckResult, RunReport, StageReport};
pub use source::{JsonLinesSource, RowSource, SourceError, StaticRowSource};
pub use stage::{LoadStage, QualityGateStage, Stage, StageContext, StagingStage};
