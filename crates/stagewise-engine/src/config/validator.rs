//! Semantic validation for parsed pipeline configuration values.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use anyhow::{bail, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use regex::Regex;

use crate::config::types::{LoadStageConfig, PipelineConfig, StageConfig};
use crate::shape::{ColumnSource, Derivation};
use crate::source::{is_date_pattern, parse_date_pattern};

/// Upper bound on per-stage retries.
pub const MAX_RETRIES: u32 = 20;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid stage name regex"));

const SUPPORTED_BACKENDS: &[&str] = &["sqlite"];

/// Dependency graph over declared stages; edges point from dependency to dependent.
struct StageGraph<'c> {
    graph: DiGraph<&'c str, ()>,
    index: HashMap<&'c str, NodeIndex>,
}

impl<'c> StageGraph<'c> {
    fn build(config: &'c PipelineConfig) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for stage in &config.stages {
            index
                .entry(stage.name())
                .or_insert_with(|| graph.add_node(stage.name()));
        }
        for stage in &config.stages {
            let to = index[stage.name()];
            for dep in stage.depends_on() {
                if let Some(&from) = index.get(dep.as_str()) {
                    graph.update_edge(from, to, ());
                }
            }
        }
        Self { graph, index }
    }

    /// Whether `ancestor` must finish before `stage` starts.
    fn precedes(&self, ancestor: &str, stage: &str) -> bool {
        match (self.index.get(ancestor), self.index.get(stage)) {
            (Some(&a), Some(&s)) => a != s && has_path_connecting(&self.graph, a, s, None),
            _ => false,
        }
    }
}

fn validate_policy(
    retries: Option<u32>,
    timeout_seconds: Option<u64>,
    context: &str,
    errors: &mut Vec<String>,
) {
    if retries.is_some_and(|r| r > MAX_RETRIES) {
        errors.push(format!("{context}: retries must be at most {MAX_RETRIES}"));
    }
    if timeout_seconds == Some(0) {
        errors.push(format!("{context}: timeout_seconds must be > 0"));
    }
}

fn validate_backend(backend: &str, context: &str, errors: &mut Vec<String>) {
    if !SUPPORTED_BACKENDS.contains(&backend) {
        errors.push(format!(
            "{context}: unsupported backend '{backend}', expected one of {}",
            SUPPORTED_BACKENDS.join(", ")
        ));
    }
}

/// Fields a derivation reads from the staging row.
fn derivation_inputs(derivation: &Derivation) -> Vec<&str> {
    match derivation {
        Derivation::EpochMillis { field } | Derivation::TimePart { field, .. } => vec![field.as_str()],
        Derivation::Hash { fields } => fields.iter().map(String::as_str).collect(),
        Derivation::Lookup { on, .. } => on.values().map(String::as_str).collect(),
    }
}

fn validate_load(
    load: &LoadStageConfig,
    config: &PipelineConfig,
    graph: &StageGraph<'_>,
    errors: &mut Vec<String>,
) {
    let ctx = format!("Stage '{}'", load.name);

    if let Err(e) = load.target.validate() {
        errors.push(format!("{ctx}: {}", e.message));
    }

    let staging = config.stages.iter().find_map(|s| match s {
        StageConfig::Staging(st) if st.table == load.staging_table => Some(st),
        _ => None,
    });
    let Some(staging) = staging else {
        errors.push(format!(
            "{ctx}: staging table '{}' is not filled by any staging stage",
            load.staging_table
        ));
        return;
    };
    if !graph.precedes(&staging.name, &load.name) {
        errors.push(format!(
            "{ctx}: must depend on '{}', which fills '{}'",
            staging.name, load.staging_table
        ));
    }

    let staged_field = |field: &str| staging.fields.iter().any(|f| f == field);

    for field in load.filters.keys() {
        if !staged_field(field) {
            errors.push(format!("{ctx}: filter field '{field}' is not a staging field"));
        }
    }

    for field in &load.target.fields {
        if !load.columns.contains_key(field) && !staged_field(field) {
            errors.push(format!(
                "{ctx}: target column '{field}' has no source and is not a staging field"
            ));
        }
    }

    for (column, source) in &load.columns {
        if !load.target.fields.contains(column) {
            errors.push(format!("{ctx}: column '{column}' is not a field of '{}'", load.target.name));
        }
        let inputs = match source {
            ColumnSource::Field(field) => vec![field.as_str()],
            ColumnSource::Derived(derivation) => derivation_inputs(derivation),
        };
        if inputs.is_empty() {
            errors.push(format!("{ctx}: column '{column}' reads no staging field"));
        }
        for input in inputs {
            if !staged_field(input) {
                errors.push(format!(
                    "{ctx}: column '{column}' reads '{input}', which is not a staging field"
                ));
            }
        }
        if let ColumnSource::Derived(Derivation::Lookup { table, on, select }) = source {
            validate_lookup(
                &ctx,
                column,
                (table.as_str(), on, select.as_str()),
                config,
                graph,
                &load.name,
                errors,
            );
        }
    }

    if let Some(field) = load.tie_break.field() {
        if !staged_field(field) && !load.target.fields.iter().any(|f| f == field) {
            errors.push(format!(
                "{ctx}: tie_break field '{field}' is neither a staging field nor a target field"
            ));
        }
    }
}

fn validate_lookup(
    ctx: &str,
    column: &str,
    lookup: (&str, &BTreeMap<String, String>, &str),
    config: &PipelineConfig,
    graph: &StageGraph<'_>,
    stage: &str,
    errors: &mut Vec<String>,
) {
    let (table, on, select) = lookup;
    let provider = config.stages.iter().find_map(|s| match s {
        StageConfig::LoadDimension(l) | StageConfig::LoadFact(l) if l.target.name == table => {
            Some(l)
        }
        _ => None,
    });
    let Some(provider) = provider else {
        errors.push(format!(
            "{ctx}: column '{column}' looks up '{table}', which no load stage targets"
        ));
        return;
    };
    if !graph.precedes(&provider.name, stage) {
        errors.push(format!(
            "{ctx}: column '{column}' looks up '{table}' but does not depend on '{}'",
            provider.name
        ));
    }
    if on.is_empty() {
        errors.push(format!("{ctx}: lookup for '{column}' has no match columns"));
    }
    for used in on.keys().map(String::as_str).chain([select]) {
        if !provider.target.fields.iter().any(|f| f == used) {
            errors.push(format!(
                "{ctx}: column '{column}' uses '{used}', which is not a field of '{table}'"
            ));
        }
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    validate_backend(&config.store.backend, "store", &mut errors);
    validate_backend(&config.state.backend, "state", &mut errors);
    validate_policy(
        Some(config.policy.retries),
        config.policy.timeout_seconds,
        "policy",
        &mut errors,
    );

    if config.stages.is_empty() {
        errors.push("Pipeline must define at least one stage".to_string());
    }

    let mut names = BTreeSet::new();
    for (i, stage) in config.stages.iter().enumerate() {
        let name = stage.name();
        if name.trim().is_empty() {
            errors.push(format!("Stage {i} has an empty name"));
        } else if !NAME_RE.is_match(name) {
            errors.push(format!(
                "Stage name '{name}' must start with a letter or '_' and contain only letters, digits and '_'"
            ));
        }
        if !names.insert(name) {
            errors.push(format!("Stage name '{name}' is declared more than once"));
        }
    }

    for stage in &config.stages {
        let ctx = format!("Stage '{}'", stage.name());
        for dep in stage.depends_on() {
            match config.stage(dep) {
                None => errors.push(format!("{ctx}: depends on unknown stage '{dep}'")),
                Some(upstream) if upstream.kind() > stage.kind() => errors.push(format!(
                    "{ctx}: a {} stage cannot depend on {} stage '{dep}'",
                    stage.kind().as_str(),
                    upstream.kind().as_str()
                )),
                Some(_) => {}
            }
        }
        let policy = stage.policy();
        validate_policy(policy.retries, policy.timeout_seconds, &ctx, &mut errors);
    }

    let graph = StageGraph::build(config);
    if let Err(cycle) = toposort(&graph.graph, None) {
        errors.push(format!(
            "Stage dependencies contain a cycle through '{}'",
            graph.graph[cycle.node_id()]
        ));
    }

    let mut staging_tables = BTreeSet::new();
    let mut target_tables = BTreeSet::new();
    for stage in &config.stages {
        let ctx = format!("Stage '{}'", stage.name());
        match stage {
            StageConfig::Staging(staging) => {
                if !staging_tables.insert(staging.table.as_str()) {
                    errors.push(format!(
                        "{ctx}: staging table '{}' is filled by more than one stage",
                        staging.table
                    ));
                }
                if staging.fields.is_empty() {
                    errors.push(format!("{ctx}: staging stage must declare at least one field"));
                }
                if staging.locator.trim().is_empty() {
                    errors.push(format!("{ctx}: locator must not be empty"));
                } else if is_date_pattern(&staging.locator) {
                    if let Err(e) = parse_date_pattern(&staging.locator) {
                        errors.push(format!("{ctx}: {e}"));
                    }
                }
            }
            StageConfig::LoadDimension(load) | StageConfig::LoadFact(load) => {
                if !target_tables.insert(load.target.name.as_str()) {
                    errors.push(format!(
                        "{ctx}: target table '{}' is loaded by more than one stage",
                        load.target.name
                    ));
                }
                validate_load(load, config, &graph, &mut errors);
            }
            StageConfig::QualityGate(gate) => {
                if gate.checks.is_empty() {
                    errors.push(format!("{ctx}: quality gate must declare at least one check"));
                }
            }
        }
    }
    for table in &staging_tables {
        if target_tables.contains(table) {
            errors.push(format!("Table '{table}' is both a staging and a target table"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}

/// Problems that do not block a run: quality checks that will be skipped.
#[must_use]
pub fn pipeline_warnings(config: &PipelineConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    for stage in &config.stages {
        let StageConfig::QualityGate(gate) = stage else {
            continue;
        };
        for (i, check) in gate.checks.iter().enumerate() {
            if let Err(problem) = check.compile() {
                warnings.push(format!(
                    "Stage '{}': check {i} will be skipped: {problem}",
                    gate.name
                ));
            }
        }
    }
    warnings
}
