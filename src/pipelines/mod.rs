//! The four pipelines and the registry that serves them by name.
//!
//! Every pipeline is compiled once in [`PipelineRegistry::build`] and shared
//! by all runs. Runs share nothing else: each gets its own state and
//! [`ExecutionContext`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use campus_agents::config::ServiceConfig;
//! use campus_agents::data::InMemoryStore;
//! use campus_agents::pipelines::{Collaborators, PipelineRegistry};
//! use campus_agents::provider::UnconfiguredLlm;
//! use serde_json::{json, Map};
//!
//! # tokio_test::block_on(async {
//! let deps = Collaborators::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(UnconfiguredLlm),
//!     ServiceConfig::default(),
//! );
//! let registry = PipelineRegistry::build(deps).unwrap();
//!
//! let mut input = Map::new();
//! input.insert("content".into(), json!("Click here to verify your account"));
//! let response = registry.invoke("safety", input).await;
//!
//! assert!(response.success);
//! assert_eq!(response.result.unwrap()["recommended_action"], "reject");
//! # });
//! ```

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::data::{DataError, DataGateway};
use crate::error::{Error, ErrorKind, Result, StepError};
use crate::executor::{Executor, RunOutcome};
use crate::graph::CompiledGraph;
use crate::provider::{
    invoke_with_budget, select_provider, LlmGateway, PromptPayload, ProviderHandle, UnconfiguredLlm,
};
use crate::state::{State, StateDelta, DEGRADED_REASON_FIELD};
use crate::step::{Step, StepResult};
use crate::ExecutionContext;

pub mod matching;
pub mod onboarding;
pub mod recommendations;
pub mod safety;

/// The pipelines this service can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Matching,
    Safety,
    Onboarding,
    Recommendations,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::Matching,
        PipelineKind::Safety,
        PipelineKind::Onboarding,
        PipelineKind::Recommendations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineKind::Matching => "matching",
            PipelineKind::Safety => "safety",
            PipelineKind::Onboarding => "onboarding",
            PipelineKind::Recommendations => "recommendations",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "matching" => Ok(PipelineKind::Matching),
            "safety" => Ok(PipelineKind::Safety),
            "onboarding" => Ok(PipelineKind::Onboarding),
            "recommendations" | "events_communities" => Ok(PipelineKind::Recommendations),
            other => Err(Error::Validation(format!("unknown pipeline '{other}'"))),
        }
    }
}

/// External services and settings handed to every step.
#[derive(Clone)]
pub struct Collaborators {
    pub data: Arc<dyn DataGateway>,
    pub llm: Arc<dyn LlmGateway>,
    pub config: Arc<ServiceConfig>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Collaborators {
    pub fn new(data: Arc<dyn DataGateway>, llm: Arc<dyn LlmGateway>, config: ServiceConfig) -> Self {
        Self {
            data,
            llm,
            config: Arc::new(config),
        }
    }

    /// Select the LLM provider from `config` and build its gateway with
    /// `connect`. Without any credential the service still starts, but every
    /// reasoning step fails the run as `internal`.
    pub fn with_provider<F>(data: Arc<dyn DataGateway>, config: ServiceConfig, connect: F) -> Self
    where
        F: FnOnce(ProviderHandle) -> Arc<dyn LlmGateway>,
    {
        let llm = match select_provider(&config.llm, None) {
            Ok(handle) => {
                info!(provider = %handle.kind, model = %handle.model, "LLM provider ready");
                connect(handle)
            }
            Err(err) => {
                error!(error = %err, "Reasoning steps will fail until a provider key is set");
                Arc::new(UnconfiguredLlm) as Arc<dyn LlmGateway>
            }
        };
        Self::new(data, llm, config)
    }

    /// One reasoning call under the step budget.
    ///
    /// `Ok(None)` means a recoverable failure: the caller should fall back to
    /// its deterministic result and mark the run degraded.
    pub(crate) async fn consult(
        &self,
        ctx: &ExecutionContext,
        step: &str,
        task: &str,
        input: Value,
    ) -> std::result::Result<Option<Value>, StepError> {
        let prompt = PromptPayload::new(task, input).with_temperature(self.config.llm.temperature);
        match invoke_with_budget(self.llm.as_ref(), ctx, &prompt, self.config.step_timeout()).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_recoverable() => {
                warn!(step = step, task = task, error = %err, "LLM call failed; using deterministic fallback");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Bound a data-store call by the step budget.
    pub(crate) async fn fetch<T, F>(&self, ctx: &ExecutionContext, call: F) -> std::result::Result<T, DataError>
    where
        F: Future<Output = std::result::Result<T, DataError>>,
    {
        let budget = ctx.step_budget(self.config.step_timeout());
        match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            Err(_) => Err(DataError::Unavailable(format!("no answer within {budget:?}"))),
        }
    }
}

/// Read a required string field, failing as `validation_error`.
pub(crate) fn required_str<'a>(state: &'a State, field: &str) -> std::result::Result<&'a str, StepError> {
    state
        .get_str(field)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| StepError::validation(format!("missing required field '{field}'")))
}

/// Deserialize each element of an array field, skipping malformed ones.
pub(crate) fn records<T: DeserializeOwned>(state: &State, field: &str, step: &str) -> Vec<T> {
    let Some(items) = state.get_array(field) else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match T::deserialize(item) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(step = step, field = field, index = index, error = %err, "Skipping malformed record");
                None
            }
        })
        .collect()
}

/// Record a fallback in the run metrics and tag the delta with it.
pub(crate) fn degrade(ctx: &ExecutionContext, step: &str, reason: &str, delta: StateDelta) -> StateDelta {
    ctx.record_degraded(step, reason);
    delta.degraded(reason)
}

/// Loads the requester's profile for matching and recommendations.
///
/// An unknown user fails the run. An unreachable store degrades it: the
/// profile stays absent and the graph routes straight to its final step.
pub(crate) struct FetchUserProfile {
    deps: Collaborators,
}

impl FetchUserProfile {
    pub(crate) fn new(deps: Collaborators) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Step for FetchUserProfile {
    async fn run(&self, ctx: &ExecutionContext, state: &State) -> StepResult {
        let user_id = required_str(state, "user_id")?;
        let tenant_id = required_str(state, "tenant_id")?;

        match self
            .deps
            .fetch(ctx, self.deps.data.fetch_profile(user_id, tenant_id))
            .await
        {
            Ok(Some(profile)) => {
                let campus = profile
                    .candidate
                    .campus_id
                    .clone()
                    .map_or(Value::Null, Value::String);
                Ok(StateDelta::new()
                    .set_serialized("user_profile", &profile)
                    .set("campus_id", campus))
            }
            Ok(None) => Err(StepError::validation("user profile not found")),
            Err(err) if err.is_recoverable() => {
                warn!(step = self.name(), error = %err, "Profile store unavailable");
                Ok(degrade(ctx, self.name(), "profile store unavailable", StateDelta::new()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn name(&self) -> &str {
        "fetch_user_profile"
    }
}

/// What callers get back from [`PipelineRegistry::invoke`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub success: bool,
    pub pipeline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl PipelineResponse {
    /// Shape a run outcome. Only completed runs carry a result; the partial
    /// state of a failed or timed-out run stays on [`RunOutcome::state`].
    pub fn from_outcome(kind: PipelineKind, outcome: &RunOutcome) -> Self {
        let state = outcome.state();
        let completed = outcome.is_completed();
        let result = completed.then(|| match kind {
            PipelineKind::Matching => matching::project(state),
            PipelineKind::Safety => safety::project(state),
            PipelineKind::Onboarding => onboarding::project(state),
            PipelineKind::Recommendations => recommendations::project(state),
        });
        Self {
            success: completed,
            pipeline: kind.to_string(),
            result,
            degraded: completed && state.is_degraded(),
            degraded_reason: state
                .get_str(DEGRADED_REASON_FIELD)
                .filter(|_| completed)
                .map(str::to_string),
            error: outcome.error_message(),
            error_kind: outcome.error_kind(),
        }
    }

    /// A request that never reached a pipeline.
    pub fn rejected(pipeline: &str, err: &Error) -> Self {
        Self {
            success: false,
            pipeline: pipeline.to_string(),
            result: None,
            degraded: false,
            degraded_reason: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
        }
    }
}

struct Graphs {
    matching: CompiledGraph,
    safety: CompiledGraph,
    onboarding: CompiledGraph,
    recommendations: CompiledGraph,
}

/// Compiled pipelines plus the executor that runs them.
pub struct PipelineRegistry {
    deps: Collaborators,
    executor: Executor,
    graphs: Graphs,
}

impl fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("deps", &self.deps)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl PipelineRegistry {
    /// Validate configuration and compile every pipeline.
    pub fn build(deps: Collaborators) -> Result<Self> {
        deps.config.validate()?;
        let graphs = Graphs {
            matching: matching::build(&deps)?,
            safety: safety::build(&deps)?,
            onboarding: onboarding::build(&deps)?,
            recommendations: recommendations::build(&deps)?,
        };
        let executor = Executor::new().with_grace(deps.config.cancel_grace());
        info!(pipelines = PipelineKind::ALL.len(), "Pipeline registry ready");
        Ok(Self {
            deps,
            executor,
            graphs,
        })
    }

    pub fn graph(&self, kind: PipelineKind) -> &CompiledGraph {
        match kind {
            PipelineKind::Matching => &self.graphs.matching,
            PipelineKind::Safety => &self.graphs.safety,
            PipelineKind::Onboarding => &self.graphs.onboarding,
            PipelineKind::Recommendations => &self.graphs.recommendations,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.deps.config
    }

    /// Run one pipeline under the configured graph timeout.
    pub async fn run(&self, kind: PipelineKind, input: Map<String, Value>) -> RunOutcome {
        self.run_with_budget(kind, input, self.deps.config.graph_timeout())
            .await
    }

    pub async fn run_with_budget(
        &self,
        kind: PipelineKind,
        input: Map<String, Value>,
        budget: Duration,
    ) -> RunOutcome {
        let ctx = ExecutionContext::new(budget);
        self.executor
            .run_with_ctx(&ctx, self.graph(kind), State::from_map(input))
            .await
    }

    /// Run a pipeline by name and shape the outcome for the caller.
    pub async fn invoke(&self, name: &str, input: Map<String, Value>) -> PipelineResponse {
        let kind = match name.parse::<PipelineKind>() {
            Ok(kind) => kind,
            Err(err) => {
                warn!(pipeline = name, "Unknown pipeline requested");
                return PipelineResponse::rejected(name, &err);
            }
        };
        let outcome = self.run(kind, input).await;
        PipelineResponse {
            pipeline: name.to_string(),
            ..PipelineResponse::from_outcome(kind, &outcome)
        }
    }
}
