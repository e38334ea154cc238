//! Process configuration, read once at startup.
//!
//! Values come from a TOML file (with `${VAR}` expansion) or from the
//! environment. The resulting [`ServiceConfig`] is immutable and handed to
//! constructors; steps never read the environment themselves.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::scoring::ScoringWeights;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Total wall-clock budget per run.
    pub graph_timeout_secs: u64,
    /// Cap on any single collaborator call inside a step.
    pub step_timeout_secs: u64,
    /// How long a cancelled step may take to wind down.
    pub cancel_grace_ms: u64,
    pub max_candidates: usize,
    pub default_radius_meters: f64,
    pub top_matches: usize,
    pub recent_match_days: u32,
    pub debug: bool,
    pub llm: LlmConfig,
    pub scoring: ScoringWeights,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            graph_timeout_secs: 30,
            step_timeout_secs: 20,
            cancel_grace_ms: 250,
            max_candidates: 100,
            default_radius_meters: 200_000.0,
            top_matches: 10,
            recent_match_days: 30,
            debug: false,
            llm: LlmConfig::default(),
            scoring: ScoringWeights::default(),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub primary_api_key: Option<String>,
    pub primary_model: String,
    pub secondary_api_key: Option<String>,
    pub secondary_model: String,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            primary_api_key: None,
            primary_model: "sonar".into(),
            secondary_api_key: None,
            secondary_model: "gpt-3.5-turbo".into(),
            temperature: 0.7,
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |key: &Option<String>| key.as_ref().map(|_| "<redacted>");
        f.debug_struct("LlmConfig")
            .field("primary_api_key", &redact(&self.primary_api_key))
            .field("primary_model", &self.primary_model)
            .field("secondary_api_key", &redact(&self.secondary_api_key))
            .field("secondary_model", &self.secondary_model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl ServiceConfig {
    /// Parse TOML, expanding `${VAR}` references from the environment first.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let expanded = expand_env_vars(input, |name| std::env::var(name).ok());
        let config: ServiceConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`ServiceConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ServiceConfig::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        config.llm.primary_api_key = get("PERPLEXITY_API_KEY");
        config.llm.secondary_api_key = get("OPENAI_API_KEY");
        if let Some(model) = get("PERPLEXITY_MODEL") {
            config.llm.primary_model = model;
        }
        if let Some(model) = get("OPENAI_MODEL") {
            config.llm.secondary_model = model;
        }
        if let Some(v) = get("GRAPH_TIMEOUT") {
            config.graph_timeout_secs = parse_var("GRAPH_TIMEOUT", &v)?;
        }
        if let Some(v) = get("STEP_TIMEOUT") {
            config.step_timeout_secs = parse_var("STEP_TIMEOUT", &v)?;
        }
        if let Some(v) = get("MAX_CANDIDATES") {
            config.max_candidates = parse_var("MAX_CANDIDATES", &v)?;
        }
        if let Some(v) = get("DEBUG") {
            config.debug = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.graph_timeout_secs == 0 {
            return Err(Error::Config("graph_timeout_secs must be positive".into()));
        }
        if self.step_timeout_secs == 0 {
            return Err(Error::Config("step_timeout_secs must be positive".into()));
        }
        if self.max_candidates == 0 || self.top_matches == 0 {
            return Err(Error::Config(
                "max_candidates and top_matches must be positive".into(),
            ));
        }
        if !self.default_radius_meters.is_finite() || self.default_radius_meters < 0.0 {
            return Err(Error::Config("default_radius_meters must be non-negative".into()));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(Error::Config("llm.temperature must be in [0, 2]".into()));
        }
        if self.step_timeout_secs > self.graph_timeout_secs {
            warn!(
                step = self.step_timeout_secs,
                graph = self.graph_timeout_secs,
                "Step timeout exceeds graph timeout; graph budget will bound it"
            );
        }
        self.scoring.validate()
    }

    pub fn graph_timeout(&self) -> Duration {
        Duration::from_secs(self.graph_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} has invalid value '{value}'")))
}

/// Expand `${VAR}` patterns. Unset variables expand to an empty string, so
/// an unset credential reads as absent rather than as the literal reference.
fn expand_env_vars<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                var_name.push(c);
            }
            if !closed {
                result.push_str("${");
                result.push_str(&var_name);
                continue;
            }
            match lookup(&var_name) {
                Some(val) => result.push_str(&val),
                None => warn!(var = %var_name, "Config references unset environment variable"),
            }
        } else {
            result.push(c);
        }
    }
    result
}
