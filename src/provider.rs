//! LLM provider selection and the gateway contract steps call through.
//!
//! Selection runs once at startup from static configuration. Steps never see
//! credentials; they get an `Arc<dyn LlmGateway>` built from the selected
//! [`ProviderHandle`] by whichever adapter the host process wires in.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::ExecutionContext;

/// The configured LLM backends, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Perplexity's OpenAI-compatible endpoint.
    Primary,
    /// OpenAI.
    Secondary,
}

impl ProviderKind {
    pub fn base_url(self) -> &'static str {
        match self {
            ProviderKind::Primary => "https://api.perplexity.ai",
            ProviderKind::Secondary => "https://api.openai.com/v1",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProviderKind::Primary => "perplexity",
            ProviderKind::Secondary => "openai",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ProviderKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "perplexity" => Ok(ProviderKind::Primary),
            "secondary" | "openai" => Ok(ProviderKind::Secondary),
            _ => Err(LlmError::NotConfigured),
        }
    }
}

/// The provider chosen for this process.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderHandle {
    pub kind: ProviderKind,
    pub model: String,
    pub base_url: String,
    api_key: String,
}

impl ProviderHandle {
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Failures of an LLM call, as seen by steps.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// No provider credential is configured. Fatal.
    #[error("No LLM provider configured")]
    NotConfigured,

    /// The provider answered with an error or could not be reached.
    #[error("LLM call failed: {0}")]
    CallFailed(String),

    /// The call did not finish within its step-local budget.
    #[error("LLM call timed out after {0:?}")]
    TimedOut(Duration),

    /// The provider answered but the payload could not be used.
    #[error("LLM response malformed: {0}")]
    Malformed(String),
}

impl LlmError {
    /// Whether a step may fall back to a deterministic result.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LlmError::CallFailed(_) | LlmError::TimedOut(_) | LlmError::Malformed(_)
        )
    }
}

/// Pick the provider for this process.
///
/// Without an override: primary when its credential is present, else
/// secondary, else [`LlmError::NotConfigured`]. An override selects exactly
/// that provider and fails if its credential is missing.
pub fn select_provider(
    config: &LlmConfig,
    override_kind: Option<ProviderKind>,
) -> Result<ProviderHandle, LlmError> {
    let handle = |kind: ProviderKind, key: &str, model: &str| ProviderHandle {
        kind,
        model: model.to_string(),
        base_url: kind.base_url().to_string(),
        api_key: key.to_string(),
    };
    let primary = config.primary_api_key.as_deref().filter(|k| !k.trim().is_empty());
    let secondary = config.secondary_api_key.as_deref().filter(|k| !k.trim().is_empty());

    let selected = match (override_kind, primary, secondary) {
        (Some(ProviderKind::Primary), Some(key), _) | (None, Some(key), _) => {
            handle(ProviderKind::Primary, key, &config.primary_model)
        }
        (Some(ProviderKind::Secondary), _, Some(key)) => {
            handle(ProviderKind::Secondary, key, &config.secondary_model)
        }
        (None, None, Some(key)) => {
            warn!("Primary LLM credential not set; falling back to secondary provider");
            handle(ProviderKind::Secondary, key, &config.secondary_model)
        }
        _ => return Err(LlmError::NotConfigured),
    };
    debug!(provider = %selected.kind, model = %selected.model, "Selected LLM provider");
    Ok(selected)
}

/// A structured reasoning request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPayload {
    /// Which reasoning task this is, e.g. `"matching_reasoning"`.
    pub task: String,
    /// Task inputs; the adapter renders them into its prompt template.
    pub input: Value,
    pub temperature: f32,
}

impl PromptPayload {
    pub fn new(task: impl Into<String>, input: Value) -> Self {
        Self {
            task: task.into(),
            input,
            temperature: 0.7,
        }
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// "Invoke a reasoning step, get a structured result or a failure."
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Run one reasoning call. Implementations must give up after `timeout`.
    async fn invoke(&self, prompt: &PromptPayload, timeout: Duration) -> Result<Value, LlmError>;
}

/// Gateway used when provider selection failed: every call is fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredLlm;

#[async_trait]
impl LlmGateway for UnconfiguredLlm {
    async fn invoke(&self, _prompt: &PromptPayload, _timeout: Duration) -> Result<Value, LlmError> {
        Err(LlmError::NotConfigured)
    }
}

/// Invoke `llm` with a timeout derived from the run's remaining budget.
///
/// The timeout is enforced here as well, so a gateway that ignores its
/// argument still cannot hold the step past the budget.
pub async fn invoke_with_budget(
    llm: &dyn LlmGateway,
    ctx: &ExecutionContext,
    prompt: &PromptPayload,
    cap: Duration,
) -> Result<Value, LlmError> {
    let budget = ctx.step_budget(cap);
    if budget.is_zero() {
        return Err(LlmError::TimedOut(budget));
    }
    ctx.record_llm_call();
    match tokio::time::timeout(budget, llm.invoke(prompt, budget)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::TimedOut(budget)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(primary: Option<&str>, secondary: Option<&str>) -> LlmConfig {
        LlmConfig {
            primary_api_key: primary.map(str::to_string),
            secondary_api_key: secondary.map(str::to_string),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_prefers_primary() {
        let handle = select_provider(&config(Some("pk"), Some("sk")), None).unwrap();
        assert_eq!(handle.kind, ProviderKind::Primary);
        assert_eq!(handle.model, "sonar");
        assert_eq!(handle.api_key(), "pk");
    }

    #[test]
    fn test_falls_back_to_secondary() {
        let handle = select_provider(&config(None, Some("sk")), None).unwrap();
        assert_eq!(handle.kind, ProviderKind::Secondary);
        assert_eq!(handle.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn test_blank_keys_count_as_missing() {
        let err = select_provider(&config(Some("  "), Some("")), None).unwrap_err();
        assert_eq!(err, LlmError::NotConfigured);
    }

    #[test]
    fn test_override_is_strict() {
        let cfg = config(Some("pk"), None);
        assert_eq!(
            select_provider(&cfg, Some(ProviderKind::Secondary)).unwrap_err(),
            LlmError::NotConfigured
        );
        let handle = select_provider(&config(Some("pk"), Some("sk")), Some(ProviderKind::Secondary)).unwrap();
        assert_eq!(handle.kind, ProviderKind::Secondary);
    }

    #[test]
    fn test_debug_redacts_key() {
        let handle = select_provider(&config(Some("secret-key"), None), None).unwrap();
        let printed = format!("{handle:?}");
        assert!(!printed.contains("secret-key"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("perplexity".parse::<ProviderKind>().unwrap(), ProviderKind::Primary);
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::Secondary);
        assert!("anthropic".parse::<ProviderKind>().is_err());
    }

    struct Slow;

    #[async_trait]
    impl LlmGateway for Slow {
        async fn invoke(&self, _prompt: &PromptPayload, _timeout: Duration) -> Result<Value, LlmError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_enforced_around_gateway() {
        let ctx = ExecutionContext::new(Duration::from_secs(5));
        let prompt = PromptPayload::new("test", Value::Null);
        let err = invoke_with_budget(&Slow, &ctx, &prompt, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::TimedOut(Duration::from_secs(2)));
        assert_eq!(ctx.snapshot().llm_calls, 1);
    }

    #[tokio::test]
    async fn test_unconfigured_gateway_is_fatal() {
        let ctx = ExecutionContext::new(Duration::from_secs(5));
        let prompt = PromptPayload::new("test", Value::Null);
        let err = invoke_with_budget(&UnconfiguredLlm, &ctx, &prompt, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!err.is_recoverable());
    }
}
