//! Safety: moderate one piece of user content.
//!
//! ```text
//! detect_spam_patterns -> check_explicit_content
//!     -[max_confidence >= 0.75]-> determine_action
//!     -[otherwise]-> classify_uncertain -> determine_action
//! determine_action -> finalize_safety_response
//! ```
//!
//! Pattern rules decide the clear cases without an LLM call.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{degrade, Collaborators};
use crate::error::{Error, Result};
use crate::graph::{CompiledGraph, EdgeCondition, GraphDefinition, Target};
use crate::schema::{FieldType, InputSchema};
use crate::state::{State, StateDelta};
use crate::step::{Step, StepResult};
use crate::ExecutionContext;

const SPAM_KEYWORDS: &[&str] = &["click here", "buy now", "limited offer"];
const PHISHING_PATTERNS: &[&str] = &[r"verify.*account", r"confirm.*password"];
const BANNED_WORDS: &[&str] = &["slur1", "slur2"];

/// Flags at or above this confidence skip the LLM classifier.
pub const CONCLUSIVE_CONFIDENCE: f64 = 0.75;
/// Flags at or above this confidence send content to human review.
pub const REVIEW_CONFIDENCE: f64 = 0.7;
/// Confidence used when the classifier is unreachable and no rule fired.
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Moderation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Review,
    Reject,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Review => "review",
            Action::Reject => "reject",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Some(Action::Allow),
            "review" => Some(Action::Review),
            "reject" => Some(Action::Reject),
            _ => None,
        }
    }
}

/// One rule hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub flag: String,
    pub confidence: f64,
    pub rule: String,
}

impl Flag {
    fn new(flag: &str, confidence: f64, rule: &str) -> Self {
        Self {
            flag: flag.to_string(),
            confidence,
            rule: rule.to_string(),
        }
    }
}

fn flags(state: &State) -> Vec<Flag> {
    state.get_as::<Vec<Flag>>("flags").unwrap_or_default()
}

fn max_confidence(flags: &[Flag]) -> f64 {
    flags.iter().map(|f| f.confidence).fold(0.0, f64::max)
}

fn content(state: &State) -> String {
    state.get_str("content").unwrap_or_default().to_lowercase()
}

fn with_flags(flags: &[Flag]) -> StateDelta {
    StateDelta::new()
        .set_serialized("flags", &flags)
        .set("max_confidence", max_confidence(flags))
}

pub(crate) fn build(deps: &Collaborators) -> Result<CompiledGraph> {
    let phishing = PHISHING_PATTERNS
        .iter()
        .map(|p| Regex::new(p).map_err(|e| Error::Definition(format!("safety pattern '{p}': {e}"))))
        .collect::<Result<Vec<_>>>()?;

    GraphDefinition::new("safety")
        .add_node("detect_spam_patterns", DetectSpamPatterns { phishing })
        .add_node("check_explicit_content", CheckExplicitContent)
        .add_node("classify_uncertain", ClassifyUncertain { deps: deps.clone() })
        .add_node("determine_action", DetermineAction)
        .add_node("finalize_safety_response", FinalizeSafetyResponse)
        .set_entry("detect_spam_patterns")
        .add_edge("detect_spam_patterns", "check_explicit_content")
        .add_conditional_edges(
            "check_explicit_content",
            vec![(
                EdgeCondition::at_least("max_confidence", CONCLUSIVE_CONFIDENCE),
                Target::node("determine_action"),
            )],
            "classify_uncertain",
        )
        .add_edge("classify_uncertain", "determine_action")
        .add_edge("determine_action", "finalize_safety_response")
        .set_finish("finalize_safety_response")
        .with_schema(
            InputSchema::new()
                .required("content", FieldType::String)
                .optional("content_type", FieldType::String)
                .optional("user_id", FieldType::String)
                .optional("tenant_id", FieldType::String),
        )
        .compile()
}

struct DetectSpamPatterns {
    phishing: Vec<Regex>,
}

#[async_trait]
impl Step for DetectSpamPatterns {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        let text = content(state);
        let mut found = flags(state);
        for keyword in SPAM_KEYWORDS {
            if text.contains(keyword) {
                found.push(Flag::new("spam", 0.8, "keyword_match"));
            }
        }
        for pattern in &self.phishing {
            if pattern.is_match(&text) {
                found.push(Flag::new("phishing", 0.9, "regex_pattern"));
            }
        }
        Ok(with_flags(&found))
    }

    fn name(&self) -> &str {
        "detect_spam_patterns"
    }
}

struct CheckExplicitContent;

#[async_trait]
impl Step for CheckExplicitContent {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        let text = content(state);
        let mut found = flags(state);
        for word in BANNED_WORDS {
            if text.contains(word) {
                found.push(Flag::new("explicit", 0.95, "banned_word"));
            }
        }
        debug!(flags = found.len(), "Pattern checks done");
        Ok(with_flags(&found))
    }

    fn name(&self) -> &str {
        "check_explicit_content"
    }
}

/// Asks the LLM about content the rules could not settle.
struct ClassifyUncertain {
    deps: Collaborators,
}

#[async_trait]
impl Step for ClassifyUncertain {
    async fn run(&self, ctx: &ExecutionContext, state: &State) -> StepResult {
        let mut found = flags(state);
        let max_conf = max_confidence(&found);
        let input = json!({
            "content_type": state.get_str("content_type").unwrap_or("message"),
            "content": state.get_str("content").unwrap_or_default(),
        });

        let answer = self
            .deps
            .consult(ctx, self.name(), "safety_classification", input)
            .await?;
        let Some(answer) = answer.filter(Value::is_object) else {
            let confidence = if max_conf > 0.0 { max_conf } else { FALLBACK_CONFIDENCE };
            let delta = StateDelta::new().set("confidence", confidence);
            return Ok(degrade(ctx, self.name(), "llm unavailable for safety classification", delta));
        };

        let confidence = answer
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        if let Some(names) = answer.get("flags").and_then(Value::as_array) {
            found.extend(
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|name| Flag::new(name, confidence, "llm_classification")),
            );
        }

        let mut delta = with_flags(&found).set("confidence", confidence);
        if let Some(action) = answer.get("action").and_then(Value::as_str).and_then(Action::parse) {
            delta.insert("llm_action", action.as_str());
        }
        Ok(delta)
    }

    fn name(&self) -> &str {
        "classify_uncertain"
    }
}

/// Combines rule flags and any classifier verdict into one action.
///
/// Explicit content and phishing always reject. Otherwise the classifier's
/// own action wins when it gave one.
struct DetermineAction;

#[async_trait]
impl Step for DetermineAction {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        let found = flags(state);
        let confidence = state
            .get_f64("confidence")
            .unwrap_or_else(|| max_confidence(&found));

        let hard_reject = found.iter().any(|f| f.flag == "explicit" || f.flag == "phishing");
        let by_rules = if hard_reject {
            Action::Reject
        } else if !found.is_empty() && confidence >= REVIEW_CONFIDENCE {
            Action::Review
        } else {
            Action::Allow
        };
        let action = match state.get_str("llm_action").and_then(Action::parse) {
            Some(llm) if !hard_reject => llm,
            _ => by_rules,
        };

        Ok(StateDelta::new()
            .set("recommended_action", action.as_str())
            .set("safe", action == Action::Allow)
            .set("confidence", confidence))
    }

    fn name(&self) -> &str {
        "determine_action"
    }
}

struct FinalizeSafetyResponse;

#[async_trait]
impl Step for FinalizeSafetyResponse {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        Ok(StateDelta::new()
            .set("safe", state.get_bool("safe").unwrap_or(false))
            .set(
                "recommended_action",
                state.get_str("recommended_action").unwrap_or("review"),
            ))
    }

    fn name(&self) -> &str {
        "finalize_safety_response"
    }
}

pub(crate) fn project(state: &State) -> Value {
    json!({
        "safe": state.get_bool("safe").unwrap_or(false),
        "recommended_action": state.get_str("recommended_action").unwrap_or("review"),
        "confidence": state.get("confidence", Value::Null),
        "flags": state.get("flags", json!([])),
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::data::InMemoryStore;
    use crate::pipelines::{PipelineKind, PipelineRegistry};
    use crate::provider::LlmError;
    use std::sync::Arc;

    async fn moderate(llm: Arc<ScriptedLlm>, text: &str) -> State {
        let registry = PipelineRegistry::build(deps(Arc::new(InMemoryStore::new()), llm)).unwrap();
        let outcome = registry
            .run(PipelineKind::Safety, input(json!({"content": text})))
            .await;
        assert!(outcome.is_completed());
        outcome.into_state()
    }

    #[tokio::test]
    async fn test_phishing_rejected_without_llm() {
        let llm = Arc::new(ScriptedLlm::failing());
        let state = moderate(llm.clone(), "Please VERIFY your account now").await;
        assert_eq!(state.get_str("recommended_action"), Some("reject"));
        assert_eq!(state.get_bool("safe"), Some(false));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_spam_goes_to_review() {
        let llm = Arc::new(ScriptedLlm::failing());
        let state = moderate(llm.clone(), "Limited offer, buy now").await;
        assert_eq!(state.get_str("recommended_action"), Some("review"));
        assert_eq!(flags(&state).len(), 2);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_clean_content_asks_classifier() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(
            json!({"is_safe": true, "confidence": 0.1, "flags": [], "action": "allow"}),
        )]));
        let state = moderate(llm.clone(), "See you at the library").await;
        assert_eq!(llm.calls(), 1);
        assert_eq!(state.get_str("recommended_action"), Some("allow"));
        assert_eq!(state.get_bool("safe"), Some(true));
        assert!(!state.is_degraded());
    }

    #[tokio::test]
    async fn test_classifier_flags_are_recorded() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(
            json!({"confidence": 0.85, "flags": ["harassment"], "action": "review"}),
        )]));
        let state = moderate(llm, "you know what you did").await;
        let found = flags(&state);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rule, "llm_classification");
        assert_eq!(state.get_str("recommended_action"), Some("review"));
    }

    #[tokio::test]
    async fn test_classifier_outage_degrades() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err(LlmError::TimedOut(
            std::time::Duration::from_secs(1),
        ))]));
        let state = moderate(llm, "hello there").await;
        assert!(state.is_degraded());
        assert_eq!(state.get_f64("confidence"), Some(0.5));
        assert_eq!(state.get_str("recommended_action"), Some("allow"));
    }

    #[tokio::test]
    async fn test_llm_cannot_override_hard_reject() {
        let mut state = State::new().merge(
            StateDelta::new()
                .set_serialized("flags", &vec![Flag::new("explicit", 0.95, "banned_word")])
                .set("llm_action", "allow"),
        );
        let ctx = ExecutionContext::new(std::time::Duration::from_secs(1));
        state = state.merge(DetermineAction.run(&ctx, &state).await.unwrap());
        assert_eq!(state.get_str("recommended_action"), Some("reject"));
    }
}
