//! Onboarding: validate one step of the profile form and prompt for the next.
//!
//! ```text
//! determine_current_step -> validate_step_data
//!     -[is_valid]-> generate_next_prompt -> save_progress -> check_completion
//!     -[otherwise]-> request_corrections
//! both -> finalize_onboarding
//! ```

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{degrade, required_str, Collaborators};
use crate::error::{Result, StepError};
use crate::graph::{CompiledGraph, EdgeCondition, GraphDefinition, Target};
use crate::schema::{FieldType, InputSchema};
use crate::state::{State, StateDelta};
use crate::step::{Step, StepResult};
use crate::ExecutionContext;

/// Steps of the onboarding form, 1-based.
pub const FINAL_STEP: i64 = 5;

const CORRECTION_PROMPT: &str = "Please fix the highlighted fields to continue.";
const FALLBACK_PROMPT: &str = "What would you like to share next?";
const FALLBACK_GUIDANCE: &str = "Provide the next piece of profile information.";

type Errors = Map<String, Value>;

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

fn filled(form: &Map<String, Value>, field: &str) -> bool {
    match form.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Bool(b)) => *b,
        Some(_) => true,
    }
}

fn reject(errors: &mut Errors, field: &str, message: &str) {
    errors.insert(field.to_string(), Value::String(message.to_string()));
}

/// Field errors for `step`, empty when the step is complete.
pub fn validate_step(step: i64, form: &Map<String, Value>) -> Errors {
    let mut errors = Errors::new();
    match step {
        1 => {
            if !filled(form, "name") {
                reject(&mut errors, "name", "Name is required.");
            }
            let email_ok = form
                .get("email")
                .and_then(Value::as_str)
                .is_some_and(|e| EMAIL.is_match(e.trim()));
            if !email_ok {
                reject(&mut errors, "email", "Valid email is required.");
            }
        }
        2 => {
            if !filled(form, "major") {
                reject(&mut errors, "major", "Major is required.");
            }
            let year_ok = form
                .get("year")
                .and_then(Value::as_i64)
                .is_some_and(|y| (1..=8).contains(&y));
            if !year_ok {
                reject(&mut errors, "year", "Year must be a valid integer.");
            }
        }
        3 => {
            if !filled(form, "bio") {
                reject(&mut errors, "bio", "Bio is required.");
            }
            if !filled(form, "interests") {
                reject(&mut errors, "interests", "Add at least one interest.");
            }
        }
        4 => {
            if !filled(form, "photoUrl") {
                reject(&mut errors, "photoUrl", "Profile photo is required.");
            }
        }
        _ => {
            let located = ["locationLat", "locationLng"]
                .iter()
                .all(|f| form.get(*f).is_some_and(Value::is_number));
            if !located {
                reject(&mut errors, "location", "Location permission required.");
            }
        }
    }
    errors
}

/// The first step whose fields are still missing.
pub fn infer_step(form: &Map<String, Value>) -> i64 {
    if !filled(form, "name") || !filled(form, "email") {
        1
    } else if !filled(form, "major") || !filled(form, "year") {
        2
    } else if !filled(form, "bio") || !filled(form, "interests") {
        3
    } else if !filled(form, "photoUrl") {
        4
    } else {
        FINAL_STEP
    }
}

fn form_data(state: &State) -> Map<String, Value> {
    state.get_object("form_data").cloned().unwrap_or_default()
}

pub(crate) fn build(deps: &Collaborators) -> Result<CompiledGraph> {
    GraphDefinition::new("onboarding")
        .add_node("determine_current_step", DetermineCurrentStep)
        .add_node("validate_step_data", ValidateStepData)
        .add_node("generate_next_prompt", GenerateNextPrompt { deps: deps.clone() })
        .add_node("save_progress", SaveProgress { deps: deps.clone() })
        .add_node("check_completion", CheckCompletion)
        .add_node("request_corrections", RequestCorrections)
        .add_node("finalize_onboarding", FinalizeOnboarding)
        .set_entry("determine_current_step")
        .add_edge("determine_current_step", "validate_step_data")
        .add_conditional_edges(
            "validate_step_data",
            vec![(EdgeCondition::truthy("is_valid"), Target::node("generate_next_prompt"))],
            "request_corrections",
        )
        .add_edge("generate_next_prompt", "save_progress")
        .add_edge("save_progress", "check_completion")
        .add_edge("check_completion", "finalize_onboarding")
        .add_edge("request_corrections", "finalize_onboarding")
        .set_finish("finalize_onboarding")
        .with_schema(
            InputSchema::new()
                .required("user_id", FieldType::NonEmptyString)
                .required("tenant_id", FieldType::NonEmptyString)
                .optional("form_data", FieldType::Object)
                .optional("current_step", FieldType::Integer),
        )
        .compile()
}

struct DetermineCurrentStep;

#[async_trait]
impl Step for DetermineCurrentStep {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        let step = match state.get_i64("current_step") {
            Some(step) if (1..=FINAL_STEP).contains(&step) => step,
            Some(step) => {
                return Err(StepError::validation(format!(
                    "current_step must be between 1 and {FINAL_STEP}, got {step}"
                )))
            }
            None => infer_step(&form_data(state)),
        };
        Ok(StateDelta::new().set("current_step", step))
    }

    fn name(&self) -> &str {
        "determine_current_step"
    }
}

struct ValidateStepData;

#[async_trait]
impl Step for ValidateStepData {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        let step = state.get_i64("current_step").unwrap_or(1);
        let errors = validate_step(step, &form_data(state));
        Ok(StateDelta::new()
            .set("is_valid", errors.is_empty())
            .set("validation_errors", Value::Object(errors)))
    }

    fn name(&self) -> &str {
        "validate_step_data"
    }
}

struct GenerateNextPrompt {
    deps: Collaborators,
}

#[async_trait]
impl Step for GenerateNextPrompt {
    async fn run(&self, ctx: &ExecutionContext, state: &State) -> StepResult {
        let input = json!({
            "current_step": state.get_i64("current_step").unwrap_or(1),
            "form_data": Value::Object(form_data(state)),
        });
        let answer = self
            .deps
            .consult(ctx, self.name(), "onboarding_guidance", input)
            .await?;

        let prompt = answer
            .as_ref()
            .and_then(|a| a.get("next_prompt"))
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty());
        match prompt {
            Some(prompt) => {
                let guidance = answer
                    .as_ref()
                    .and_then(|a| a.get("guidance"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(StateDelta::new()
                    .set("next_prompt", prompt)
                    .set("guidance", guidance))
            }
            None => {
                let delta = StateDelta::new()
                    .set("next_prompt", FALLBACK_PROMPT)
                    .set("guidance", FALLBACK_GUIDANCE);
                Ok(degrade(ctx, self.name(), "llm unavailable for onboarding guidance", delta))
            }
        }
    }

    fn name(&self) -> &str {
        "generate_next_prompt"
    }
}

/// Merges the validated form into the stored profile.
///
/// Losing a user's input is not acceptable, so store failures fail the run.
struct SaveProgress {
    deps: Collaborators,
}

#[async_trait]
impl Step for SaveProgress {
    async fn run(&self, ctx: &ExecutionContext, state: &State) -> StepResult {
        let user_id = required_str(state, "user_id")?;
        let tenant_id = required_str(state, "tenant_id")?;
        let form = form_data(state);
        let fields = form.len();

        self.deps
            .fetch(ctx, self.deps.data.save_profile_fields(user_id, tenant_id, form))
            .await
            .map_err(|err| {
                warn!(step = self.name(), error = %err, "Failed to save onboarding progress");
                StepError::from(err)
            })?;
        info!(fields, "Saved onboarding progress");
        Ok(StateDelta::new().set("saved", true))
    }

    fn name(&self) -> &str {
        "save_progress"
    }
}

struct CheckCompletion;

#[async_trait]
impl Step for CheckCompletion {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        let complete = state.get_bool("is_valid").unwrap_or(false)
            && state.get_i64("current_step").unwrap_or(1) >= FINAL_STEP;
        Ok(StateDelta::new().set("profile_complete", complete))
    }

    fn name(&self) -> &str {
        "check_completion"
    }
}

struct RequestCorrections;

#[async_trait]
impl Step for RequestCorrections {
    async fn run(&self, _ctx: &ExecutionContext, _state: &State) -> StepResult {
        Ok(StateDelta::new()
            .set("next_prompt", CORRECTION_PROMPT)
            .set("profile_complete", false))
    }

    fn name(&self) -> &str {
        "request_corrections"
    }
}

struct FinalizeOnboarding;

#[async_trait]
impl Step for FinalizeOnboarding {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        Ok(StateDelta::new().set(
            "profile_complete",
            state.get_bool("profile_complete").unwrap_or(false),
        ))
    }

    fn name(&self) -> &str {
        "finalize_onboarding"
    }
}

pub(crate) fn project(state: &State) -> Value {
    json!({
        "current_step": state.get("current_step", Value::Null),
        "is_valid": state.get_bool("is_valid").unwrap_or(false),
        "validation_errors": state.get("validation_errors", json!({})),
        "next_prompt": state.get("next_prompt", Value::Null),
        "guidance": state.get("guidance", Value::Null),
        "profile_complete": state.get_bool("profile_complete").unwrap_or(false),
    })
}
