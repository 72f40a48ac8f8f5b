//! Pipeline coordinator: drives stages through the dependency graph.
//!
//! Stages whose upstream stages all succeeded run concurrently on the
//! blocking pool. A failed or skipped stage skips everything downstream of
//! it. Retries, per-attempt timeouts and run cancellation are handled here;
//! stages themselves run one attempt at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use stagewise_store::{RunHistory, TargetStore};
use stagewise_types::{
    ConfigurationError, PipelineId, RunId, RunOutcome, StageError, StageName, StageResult,
    StageStatus, TimeRange,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::errors::RetryPolicy;
use crate::result::{RunReport, StageReport};
use crate::source::RowSource;
use crate::stage::{Stage, StageContext};

/// A stage with its dependencies and retry policy.
#[derive(Debug, Clone)]
pub struct StageNode {
    pub stage: Arc<Stage>,
    pub depends_on: Vec<StageName>,
    pub policy: RetryPolicy,
}

impl StageNode {
    #[must_use]
    pub fn new(stage: Stage) -> Self {
        Self {
            stage: Arc::new(stage),
            depends_on: Vec::new(),
            policy: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StageName>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

enum NodeState {
    Pending,
    Running,
    Done(StageResult),
}

pub struct Coordinator {
    pipeline: PipelineId,
    graph: DiGraph<StageNode, ()>,
    order: Vec<NodeIndex>,
    store: Arc<dyn TargetStore>,
    source: Arc<dyn RowSource>,
    history: Option<Arc<dyn RunHistory>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("pipeline", &self.pipeline)
            .field("stages", &self.order.len())
            .field("history", &self.history.is_some())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Build the stage graph.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] on duplicate stage names, unknown
    /// dependencies or a dependency cycle.
    pub fn new(
        pipeline: PipelineId,
        nodes: Vec<StageNode>,
        store: Arc<dyn TargetStore>,
        source: Arc<dyn RowSource>,
    ) -> Result<Self, ConfigurationError> {
        let mut graph = DiGraph::new();
        let mut index: HashMap<StageName, NodeIndex> = HashMap::new();
        for node in nodes {
            let name = node.stage.name().clone();
            if index.contains_key(&name) {
                return Err(ConfigurationError::new(format!(
                    "stage '{name}' is declared more than once"
                )));
            }
            index.insert(name, graph.add_node(node));
        }

        let mut edges = Vec::new();
        for to in graph.node_indices() {
            let node = &graph[to];
            for dep in &node.depends_on {
                let from = index.get(dep).ok_or_else(|| {
                    ConfigurationError::new(format!(
                        "stage '{}' depends on unknown stage '{dep}'",
                        node.stage.name()
                    ))
                })?;
                edges.push((*from, to));
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            ConfigurationError::new(format!(
                "stage dependencies contain a cycle through '{}'",
                graph[cycle.node_id()].stage.name()
            ))
        })?;

        Ok(Self {
            pipeline,
            graph,
            order,
            store,
            source,
            history: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Record runs and stage outcomes in `history`.
    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn RunHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Share an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops new stages from starting once cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&StageName> {
        self.order.iter().map(|&i| self.graph[i].stage.name()).collect()
    }

    /// Run every stage for `window`.
    pub async fn run(&self, window: TimeRange) -> RunReport {
        let started = Instant::now();
        tracing::info!(
            pipeline = %self.pipeline,
            window = %window,
            stages = self.order.len(),
            "Starting pipeline run"
        );
        let run_id = self.start_run(window).await;

        let mut states: HashMap<NodeIndex, NodeState> =
            self.order.iter().map(|&i| (i, NodeState::Pending)).collect();
        let mut tasks: JoinSet<(NodeIndex, StageResult)> = JoinSet::new();

        loop {
            for &idx in &self.order {
                if !matches!(states[&idx], NodeState::Pending) {
                    continue;
                }
                match self.readiness(idx, &states) {
                    Readiness::Waiting => {}
                    Readiness::Blocked(reason) => {
                        self.finish(idx, StageResult::skipped(reason), run_id, &mut states)
                            .await;
                    }
                    Readiness::Ready if self.cancel.is_cancelled() => {
                        self.finish(idx, StageResult::skipped("run cancelled"), run_id, &mut states)
                            .await;
                    }
                    Readiness::Ready => {
                        let node = &self.graph[idx];
                        tracing::info!(stage = %node.stage.name(), kind = node.stage.kind(), "Starting stage");
                        tasks.spawn(run_with_retries(
                            idx,
                            Arc::clone(&node.stage),
                            node.policy,
                            Arc::clone(&self.store),
                            Arc::clone(&self.source),
                            window,
                            self.cancel.clone(),
                        ));
                        states.insert(idx, NodeState::Running);
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                let lost: Vec<NodeIndex> = self
                    .order
                    .iter()
                    .copied()
                    .filter(|i| matches!(states[i], NodeState::Running))
                    .collect();
                if lost.is_empty() {
                    break;
                }
                for idx in lost {
                    let err = StageError::internal("stage task ended without a result");
                    self.finish(idx, StageResult::failed(&err), run_id, &mut states)
                        .await;
                }
                continue;
            };
            match joined {
                Ok((idx, result)) => self.finish(idx, result, run_id, &mut states).await,
                Err(join_err) => tracing::error!(error = %join_err, "Stage task panicked"),
            }
        }

        let stages: Vec<StageReport> = self
            .order
            .iter()
            .map(|&idx| {
                let stage = &self.graph[idx].stage;
                let result = match states.remove(&idx) {
                    Some(NodeState::Done(result)) => result,
                    _ => StageResult::failed(&StageError::internal("stage never finished")),
                };
                StageReport {
                    name: stage.name().clone(),
                    kind: stage.kind(),
                    result,
                }
            })
            .collect();
        let outcome = run_outcome(&stages);
        self.complete_run(run_id, &outcome).await;

        let duration = started.elapsed();
        if outcome.is_success() {
            tracing::info!(pipeline = %self.pipeline, duration_secs = duration.as_secs_f64(), "Pipeline run succeeded");
        } else {
            tracing::error!(pipeline = %self.pipeline, outcome = %outcome, "Pipeline run did not succeed");
        }

        RunReport {
            pipeline: self.pipeline.clone(),
            run_id,
            window,
            stages,
            outcome,
            duration,
        }
    }

    fn readiness(&self, idx: NodeIndex, states: &HashMap<NodeIndex, NodeState>) -> Readiness {
        let mut waiting = false;
        for dep in self.graph.neighbors_directed(idx, Direction::Incoming) {
            match &states[&dep] {
                NodeState::Done(result) if result.is_success() => {}
                NodeState::Done(result) => {
                    let verb = if result.status == StageStatus::Skipped {
                        "was skipped"
                    } else {
                        "failed"
                    };
                    return Readiness::Blocked(format!(
                        "upstream stage '{}' {verb}",
                        self.graph[dep].stage.name()
                    ));
                }
                NodeState::Pending | NodeState::Running => waiting = true,
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    async fn finish(
        &self,
        idx: NodeIndex,
        result: StageResult,
        run_id: Option<RunId>,
        states: &mut HashMap<NodeIndex, NodeState>,
    ) {
        let name = self.graph[idx].stage.name().clone();
        match result.status {
            StageStatus::Succeeded => tracing::info!(
                stage = %name,
                attempts = result.attempts,
                rows = result.rows_affected,
                reason = %result.reason,
                "Stage succeeded"
            ),
            StageStatus::Skipped => {
                tracing::warn!(stage = %name, reason = %result.reason, "Stage skipped");
            }
            _ => tracing::error!(
                stage = %name,
                attempts = result.attempts,
                reason = %result.reason,
                "Stage failed"
            ),
        }

        if let (Some(history), Some(run_id)) = (&self.history, run_id) {
            let history = Arc::clone(history);
            let record = result.clone();
            let stage = name.clone();
            let recorded =
                tokio::task::spawn_blocking(move || history.record_stage(run_id, &stage, &record))
                    .await;
            match recorded {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(stage = %name, error = %e, "Failed to record stage outcome"),
                Err(e) => tracing::warn!(stage = %name, error = %e, "record_stage task panicked"),
            }
        }
        states.insert(idx, NodeState::Done(result));
    }

    async fn start_run(&self, window: TimeRange) -> Option<RunId> {
        let history = Arc::clone(self.history.as_ref()?);
        let pipeline = self.pipeline.clone();
        match tokio::task::spawn_blocking(move || history.start_run(&pipeline, &window)).await {
            Ok(Ok(run_id)) => Some(run_id),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to record run start, continuing without history");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "start_run task panicked, continuing without history");
                None
            }
        }
    }

    async fn complete_run(&self, run_id: Option<RunId>, outcome: &RunOutcome) {
        let (Some(history), Some(run_id)) = (&self.history, run_id) else {
            return;
        };
        let history = Arc::clone(history);
        let outcome = outcome.clone();
        match tokio::task::spawn_blocking(move || history.complete_run(run_id, &outcome)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(run_id, error = %e, "Failed to record run completion"),
            Err(e) => tracing::warn!(run_id, error = %e, "complete_run task panicked"),
        }
    }
}

enum Readiness {
    Waiting,
    Blocked(String),
    Ready,
}

/// `Failed` (first failure in dependency order) over `PartiallySkipped` over `Succeeded`.
fn run_outcome(stages: &[StageReport]) -> RunOutcome {
    if let Some(failed) = stages.iter().find(|s| s.result.is_failure()) {
        return RunOutcome::Failed {
            stage: failed.name.clone(),
            reason: failed.result.reason.clone(),
        };
    }
    let skipped: Vec<StageName> = stages
        .iter()
        .filter(|s| s.result.status == StageStatus::Skipped)
        .map(|s| s.name.clone())
        .collect();
    if skipped.is_empty() {
        RunOutcome::Succeeded
    } else {
        RunOutcome::PartiallySkipped { skipped }
    }
}

async fn run_with_retries(
    idx: NodeIndex,
    stage: Arc<Stage>,
    policy: RetryPolicy,
    store: Arc<dyn TargetStore>,
    source: Arc<dyn RowSource>,
    window: TimeRange,
    cancel: CancellationToken,
) -> (NodeIndex, StageResult) {
    let name = stage.name().clone();
    let max_retries = policy.retries;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = run_attempt(&stage, policy, &store, &source, window).await;

        match result {
            Ok(result) => return (idx, result.with_attempts(attempt)),
            Err(err) if policy.should_retry(&err, attempt) => {
                #[allow(clippy::cast_possible_truncation)]
                let delay_ms = policy.delay.as_millis() as u64;
                tracing::warn!(
                    stage = %name,
                    attempt,
                    max_retries,
                    delay_ms,
                    category = %err.category,
                    error = %err.message,
                    "Retryable error, will retry"
                );
                tokio::select! {
                    () = tokio::time::sleep(policy.delay) => {}
                    () = cancel.cancelled() => {
                        tracing::warn!(stage = %name, attempt, "Run cancelled, abandoning retries");
                        return (idx, StageResult::failed(&err).with_attempts(attempt));
                    }
                }
            }
            Err(err) => {
                if err.retryable {
                    tracing::error!(
                        stage = %name,
                        attempt,
                        max_retries,
                        category = %err.category,
                        "Max retries exhausted, failing stage"
                    );
                } else {
                    tracing::error!(
                        stage = %name,
                        category = %err.category,
                        "Non-retryable error, failing stage"
                    );
                }
                return (idx, StageResult::failed(&err).with_attempts(attempt));
            }
        }
    }
}

async fn run_attempt(
    stage: &Arc<Stage>,
    policy: RetryPolicy,
    store: &Arc<dyn TargetStore>,
    source: &Arc<dyn RowSource>,
    window: TimeRange,
) -> Result<StageResult, StageError> {
    let deadline = policy.timeout.map(|t| Instant::now() + t);
    let stage = Arc::clone(stage);
    let store = Arc::clone(store);
    let source = Arc::clone(source);
    let handle = tokio::task::spawn_blocking(move || {
        let ctx = StageContext {
            store: store.as_ref(),
            source: source.as_ref(),
            window,
            deadline,
        };
        stage.run(&ctx)
    });

    let joined = match policy.timeout {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(StageError::timeout(format!(
                    "stage exceeded its {:.1}s timeout",
                    limit.as_secs_f64()
                )))
            }
        },
        None => handle.await,
    };
    joined.map_err(|e| StageError::internal(format!("stage task panicked: {e}")))?
}
