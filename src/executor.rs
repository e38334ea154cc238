//! Runs a compiled graph against one initial state under a wall-clock budget.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{ErrorKind, StepError};
use crate::events::{RunEvent, TraceEntry};
use crate::graph::{CompiledGraph, Target};
use crate::metrics::RunMetrics;
use crate::state::State;
use crate::ExecutionContext;

/// Default time a step gets to wind down after the deadline fires.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_millis(250);

/// How a run ended. Every variant carries the last committed state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The run reached the terminal sentinel.
    Completed { state: State },
    /// A step failed; `state` is the state from just before that step.
    Failed {
        kind: ErrorKind,
        message: String,
        state: State,
    },
    /// The deadline passed; `state` holds everything committed before it.
    TimedOut { state: State },
}

impl RunOutcome {
    /// The state carried by this outcome.
    pub fn state(&self) -> &State {
        match self {
            RunOutcome::Completed { state }
            | RunOutcome::Failed { state, .. }
            | RunOutcome::TimedOut { state } => state,
        }
    }

    pub fn into_state(self) -> State {
        match self {
            RunOutcome::Completed { state }
            | RunOutcome::Failed { state, .. }
            | RunOutcome::TimedOut { state } => state,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    /// The failure kind, with timeouts reported as [`ErrorKind::Timeout`].
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            RunOutcome::Completed { .. } => None,
            RunOutcome::Failed { kind, .. } => Some(*kind),
            RunOutcome::TimedOut { .. } => Some(ErrorKind::Timeout),
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            RunOutcome::Completed { .. } => None,
            RunOutcome::Failed { message, .. } => Some(message.clone()),
            RunOutcome::TimedOut { .. } => Some("pipeline run exceeded its deadline".to_string()),
        }
    }

    pub(crate) fn failed(err: StepError, state: State) -> Self {
        RunOutcome::Failed {
            kind: err.kind,
            message: err.message,
            state,
        }
    }
}

/// A run outcome together with what was observed along the way.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub metrics: RunMetrics,
    pub trace: Vec<TraceEntry>,
}

/// Drives one graph instance at a time. Holds no per-run state, so a single
/// executor can serve any number of concurrent runs.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use campus_agents::graph::GraphDefinition;
/// use campus_agents::{Executor, LambdaStep, State, StateDelta};
///
/// # tokio_test::block_on(async {
/// let graph = GraphDefinition::new("double")
///     .add_node("double", LambdaStep::new(|s: State| async move {
///         Ok(StateDelta::new().set("x", s.get_i64("x").unwrap_or(0) * 2))
///     }))
///     .set_entry("double")
///     .set_finish("double")
///     .compile()
///     .unwrap();
///
/// let initial = State::new().merge(StateDelta::new().set("x", 21));
/// let outcome = Executor::new().run(&graph, initial, Duration::from_secs(1)).await;
/// assert!(outcome.is_completed());
/// assert_eq!(outcome.state().get_i64("x"), Some(42));
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct Executor {
    grace: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Set how long a cancelled step may take to wind down.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Run `graph` from `initial` with a total wall-clock `budget`.
    pub async fn run(&self, graph: &CompiledGraph, initial: State, budget: Duration) -> RunOutcome {
        let ctx = ExecutionContext::new(budget);
        self.run_with_ctx(&ctx, graph, initial).await
    }

    /// Like [`Executor::run`], also returning metrics and the trace.
    pub async fn run_traced(
        &self,
        graph: &CompiledGraph,
        initial: State,
        budget: Duration,
    ) -> RunReport {
        let ctx = ExecutionContext::new(budget);
        let outcome = self.run_with_ctx(&ctx, graph, initial).await;
        RunReport {
            outcome,
            metrics: ctx.snapshot(),
            trace: ctx.trace_snapshot(),
        }
    }

    /// Run with a caller-provided context; its deadline bounds the run.
    pub async fn run_with_ctx(
        &self,
        ctx: &ExecutionContext,
        graph: &CompiledGraph,
        initial: State,
    ) -> RunOutcome {
        let span = info_span!("pipeline_run", pipeline = %graph.name(), run_id = %ctx.run_id());
        async {
            let started = Instant::now();
            let outcome = self.drive(ctx, graph, initial).await;
            let elapsed = started.elapsed();
            ctx.record_elapsed(elapsed);

            match &outcome {
                RunOutcome::Completed { state } => info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    degraded = state.is_degraded(),
                    "Pipeline run completed"
                ),
                RunOutcome::Failed { kind, message, .. } => warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    kind = %kind,
                    error = %message,
                    "Pipeline run failed"
                ),
                RunOutcome::TimedOut { .. } => warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Pipeline run timed out"
                ),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, ctx: &ExecutionContext, graph: &CompiledGraph, initial: State) -> RunOutcome {
        if let Some(schema) = graph.schema() {
            if let Err(err) = schema.validate(&initial) {
                ctx.record_failure(err.to_string());
                return RunOutcome::failed(StepError::from(err), initial);
            }
        }

        let mut state = initial;
        let mut current = graph.entry().to_string();

        loop {
            if ctx.is_expired() {
                ctx.cancel();
                ctx.emit(RunEvent::DeadlineExceeded { step: None });
                ctx.record_failure("deadline exceeded before step started");
                return RunOutcome::TimedOut { state };
            }

            let Some(step) = graph.step(&current) else {
                let err = StepError::internal(format!("node '{current}' has no step"));
                return RunOutcome::failed(err, state);
            };

            debug!(step = %current, "Executing step");
            ctx.emit(RunEvent::StepStarted {
                step: current.clone(),
            });
            let step_started = Instant::now();

            let result = {
                let fut = AssertUnwindSafe(step.run(ctx, &state)).catch_unwind();
                tokio::pin!(fut);
                let result = tokio::select! {
                    biased;
                    res = &mut fut => Some(res.unwrap_or_else(|_| {
                        Err(StepError::internal("step panicked"))
                    })),
                    _ = tokio::time::sleep_until(ctx.deadline()) => None,
                };
                if result.is_none() {
                    ctx.cancel();
                    // The step may observe cancellation and return; its
                    // output is dropped either way.
                    let _ = tokio::time::timeout(self.grace, &mut fut).await;
                }
                result
            };

            let delta = match result {
                None => {
                    warn!(step = %current, "Deadline fired while step was running");
                    ctx.emit(RunEvent::DeadlineExceeded {
                        step: Some(current.clone()),
                    });
                    ctx.record_failure(format!("deadline exceeded in step '{current}'"));
                    return RunOutcome::TimedOut { state };
                }
                Some(Err(err)) => {
                    error!(step = %current, kind = %err.kind, error = %err.message, "Step failed");
                    ctx.emit(RunEvent::StepFailed {
                        step: current.clone(),
                        kind: err.kind,
                        message: err.message.clone(),
                    });
                    ctx.record_failure(err.to_string());
                    return RunOutcome::failed(err, state);
                }
                Some(Ok(delta)) => delta,
            };

            let fields_written = delta.field_names();
            state = state.merge(delta);
            ctx.record_step();
            ctx.emit(RunEvent::StepCompleted {
                step: current.clone(),
                duration_ms: step_started.elapsed().as_millis(),
                fields_written,
            });

            let next = match graph.next_node(&current, &state) {
                Ok(next) => next,
                Err(err) => return RunOutcome::failed(StepError::from(err), state),
            };
            ctx.emit(RunEvent::Routed {
                from: current.clone(),
                to: next.as_node().map(str::to_string),
            });

            match next {
                Target::End => return RunOutcome::Completed { state },
                Target::Node(name) => current = name,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeCondition, GraphDefinition};
    use crate::schema::{FieldType, InputSchema};
    use crate::state::StateDelta;
    use crate::step::{LambdaStep, Step, StepResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn set(field: &'static str, value: i64) -> impl Step {
        LambdaStep::new(move |_| async move { Ok(StateDelta::new().set(field, value)) })
    }

    struct Hang;

    #[async_trait]
    impl Step for Hang {
        async fn run(&self, _ctx: &ExecutionContext, _state: &State) -> StepResult {
            futures::future::pending::<()>().await;
            Ok(StateDelta::new())
        }
    }

    struct Cooperative {
        saw_cancel: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Step for Cooperative {
        async fn run(&self, ctx: &ExecutionContext, _state: &State) -> StepResult {
            ctx.cancelled().await;
            self.saw_cancel.store(true, Ordering::SeqCst);
            Ok(StateDelta::new().set("late", true))
        }
    }

    #[tokio::test]
    async fn test_linear_run_merges_every_step() {
        let graph = GraphDefinition::new("g")
            .add_node("a", set("a", 1))
            .add_node("b", set("b", 2))
            .set_entry("a")
            .add_edge("a", "b")
            .set_finish("b")
            .compile()
            .unwrap();

        let report = Executor::new()
            .run_traced(&graph, State::new(), Duration::from_secs(5))
            .await;
        assert!(report.outcome.is_completed());
        assert_eq!(report.outcome.state().get_i64("a"), Some(1));
        assert_eq!(report.outcome.state().get_i64("b"), Some(2));
        assert_eq!(report.metrics.steps_completed, 2);
        assert!(!report.metrics.has_failures());
        assert!(report.trace.iter().any(|t| matches!(
            &t.event,
            RunEvent::Routed { from, to: None } if from == "b"
        )));
    }

    #[tokio::test]
    async fn test_conditional_branch_skips_node() {
        let graph = GraphDefinition::new("g")
            .add_node("check", set("conclusive", 1))
            .add_node("expensive", set("expensive_ran", 1))
            .add_node("finish", set("done", 1))
            .set_entry("check")
            .add_conditional_edges(
                "check",
                vec![(EdgeCondition::truthy("conclusive"), Target::node("finish"))],
                "expensive",
            )
            .add_edge("expensive", "finish")
            .set_finish("finish")
            .compile()
            .unwrap();

        let outcome = Executor::new()
            .run(&graph, State::new(), Duration::from_secs(5))
            .await;
        assert!(outcome.is_completed());
        assert!(!outcome.state().contains("expensive_ran"));
        assert_eq!(outcome.state().get_i64("done"), Some(1));
    }

    #[tokio::test]
    async fn test_failure_keeps_prior_state() {
        let graph = GraphDefinition::new("g")
            .add_node("a", set("a", 1))
            .add_node(
                "boom",
                LambdaStep::new(|_| async { Err(StepError::unavailable("store offline")) }),
            )
            .set_entry("a")
            .add_edge("a", "boom")
            .set_finish("boom")
            .compile()
            .unwrap();

        let outcome = Executor::new()
            .run(&graph, State::new(), Duration::from_secs(5))
            .await;
        match outcome {
            RunOutcome::Failed { kind, message, state } => {
                assert_eq!(kind, ErrorKind::CollaboratorUnavailable);
                assert!(message.contains("store offline"));
                assert_eq!(state.get_i64("a"), Some(1));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_step_is_internal_failure() {
        let graph = GraphDefinition::new("g")
            .add_node(
                "panics",
                LambdaStep::new(|state: State| async move {
                    if state.is_empty() {
                        panic!("bug");
                    }
                    Ok(StateDelta::new())
                }),
            )
            .set_entry("panics")
            .set_finish("panics")
            .compile()
            .unwrap();

        let outcome = Executor::new()
            .run(&graph, State::new(), Duration::from_secs(5))
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Internal));
    }

    #[tokio::test]
    async fn test_unbounded_budget_runs_to_completion() {
        let graph = GraphDefinition::new("g")
            .add_node("a", set("a", 1))
            .set_entry("a")
            .set_finish("a")
            .compile()
            .unwrap();

        let outcome = Executor::new().run(&graph, State::new(), Duration::MAX).await;
        assert!(outcome.is_completed());
        assert_eq!(outcome.state().get_i64("a"), Some(1));
    }

    #[tokio::test]
    async fn test_schema_violation_is_validation_error() {
        let graph = GraphDefinition::new("g")
            .add_node("a", set("a", 1))
            .set_entry("a")
            .set_finish("a")
            .with_schema(InputSchema::new().required("user_id", FieldType::NonEmptyString))
            .compile()
            .unwrap();

        let outcome = Executor::new()
            .run(&graph, State::new(), Duration::from_secs(5))
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ValidationError));
        assert!(outcome.state().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_step_times_out_with_committed_state() {
        let graph = GraphDefinition::new("g")
            .add_node("a", set("a", 1))
            .add_node("hang", Hang)
            .set_entry("a")
            .add_edge("a", "hang")
            .set_finish("hang")
            .compile()
            .unwrap();

        let grace = Duration::from_millis(100);
        let budget = Duration::from_secs(2);
        let started = Instant::now();
        let outcome = Executor::new()
            .with_grace(grace)
            .run(&graph, State::new(), budget)
            .await;

        assert!(matches!(outcome, RunOutcome::TimedOut { .. }));
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(outcome.state().get_i64("a"), Some(1));
        assert!(started.elapsed() <= budget + grace + Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_step_observes_cancellation() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let graph = GraphDefinition::new("g")
            .add_node(
                "coop",
                Cooperative {
                    saw_cancel: saw_cancel.clone(),
                },
            )
            .set_entry("coop")
            .set_finish("coop")
            .compile()
            .unwrap();

        let outcome = Executor::new()
            .run(&graph, State::new(), Duration::from_millis(500))
            .await;

        assert!(matches!(outcome, RunOutcome::TimedOut { .. }));
        assert!(saw_cancel.load(Ordering::SeqCst));
        assert!(!outcome.state().contains("late"));
    }

    #[tokio::test]
    async fn test_expired_budget_times_out_before_first_step() {
        let graph = GraphDefinition::new("g")
            .add_node("a", set("a", 1))
            .set_entry("a")
            .set_finish("a")
            .compile()
            .unwrap();

        let outcome = Executor::new()
            .run(&graph, State::new(), Duration::ZERO)
            .await;
        assert!(matches!(outcome, RunOutcome::TimedOut { .. }));
        assert!(!outcome.state().contains("a"));
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = RunOutcome::Failed {
            kind: ErrorKind::ValidationError,
            message: "bad".into(),
            state: State::new(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "validation_error");
    }
}
