use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stagewise_types::{CheckDefinition, TargetTableSpec, TieBreakRule, Value};

use crate::shape::{ColumnSource, RowShape};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub source: SourceConfig,
    pub stages: Vec<StageConfig>,
}

impl PipelineConfig {
    /// Stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name() == name)
    }
}

/// Target store holding staging, dimension and fact tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Database file, relative to the pipeline file. Defaults to
    /// `~/.stagewise/warehouse/<pipeline>.db`; `:memory:` keeps it in memory.
    pub path: Option<PathBuf>,
}

/// Run history database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Database file, relative to the pipeline file; defaults to `~/.stagewise/state.db`.
    pub path: Option<PathBuf>,
}

fn default_backend() -> String {
    "sqlite".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

/// Pipeline-wide retry and timeout defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    pub timeout_seconds: Option<u64>,
}

fn default_retries() -> u32 {
    crate::errors::DEFAULT_RETRIES
}
fn default_retry_delay_seconds() -> u64 {
    crate::errors::DEFAULT_RETRY_DELAY.as_secs()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
            timeout_seconds: None,
        }
    }
}

/// Per-stage override of [`PolicyConfig`]; unset fields inherit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub retries: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
}

impl PolicyOverride {
    #[must_use]
    pub fn resolve(&self, base: &PolicyConfig) -> PolicyConfig {
        PolicyConfig {
            retries: self.retries.unwrap_or(base.retries),
            retry_delay_seconds: self.retry_delay_seconds.unwrap_or(base.retry_delay_seconds),
            timeout_seconds: self.timeout_seconds.or(base.timeout_seconds),
        }
    }
}

/// Root directory of the JSON-lines row source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_root")]
    pub root: PathBuf,
}

fn default_source_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: default_source_root(),
        }
    }
}

/// Stage kinds in execution-phase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Staging,
    LoadDimension,
    LoadFact,
    QualityGate,
}

impl StageKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::LoadDimension => "load_dimension",
            Self::LoadFact => "load_fact",
            Self::QualityGate => "quality_gate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    Staging(StagingStageConfig),
    LoadDimension(LoadStageConfig),
    LoadFact(LoadStageConfig),
    QualityGate(QualityGateStageConfig),
}

impl StageConfig {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Staging(s) => &s.name,
            Self::LoadDimension(s) | Self::LoadFact(s) => &s.name,
            Self::QualityGate(s) => &s.name,
        }
    }

    #[must_use]
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Staging(_) => StageKind::Staging,
            Self::LoadDimension(_) => StageKind::LoadDimension,
            Self::LoadFact(_) => StageKind::LoadFact,
            Self::QualityGate(_) => StageKind::QualityGate,
        }
    }

    #[must_use]
    pub fn depends_on(&self) -> &[String] {
        match self {
            Self::Staging(s) => &s.depends_on,
            Self::LoadDimension(s) | Self::LoadFact(s) => &s.depends_on,
            Self::QualityGate(s) => &s.depends_on,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &PolicyOverride {
        match self {
            Self::Staging(s) => &s.policy,
            Self::LoadDimension(s) | Self::LoadFact(s) => &s.policy,
            Self::QualityGate(s) => &s.policy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingStageConfig {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub policy: PolicyOverride,
    pub table: String,
    pub fields: Vec<String>,
    /// Path under the source root, or a chrono date pattern.
    pub locator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadStageConfig {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub policy: PolicyOverride,
    pub staging_table: String,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnSource>,
    pub target: TargetTableSpec,
    #[serde(default)]
    pub tie_break: TieBreakRule,
}

impl LoadStageConfig {
    #[must_use]
    pub fn shape(&self) -> RowShape {
        RowShape {
            filters: self.filters.clone(),
            columns: self.columns.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateStageConfig {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub policy: PolicyOverride,
    pub checks: Vec<CheckDefinition>,
}
