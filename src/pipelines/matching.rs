//! Matching: rank compatible peers for one user and explain each match.
//!
//! ```text
//! fetch_user_profile -[profile]-> query_candidates -> filter_candidates
//!     -> score_matches -> rank_top_matches -[any]-> generate_reasoning
//!     -> finalize_response
//! ```
//!
//! Scores are deterministic. The LLM only writes the explanation and may
//! nudge the score; if it is unreachable the run still completes with
//! template reasons and the degraded marker.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{degrade, records, required_str, Collaborators, FetchUserProfile};
use crate::data::{MatchRecord, Profile};
use crate::error::{Result, StepError};
use crate::graph::{CompiledGraph, EdgeCondition, GraphDefinition, Target};
use crate::schema::{FieldType, InputSchema};
use crate::scoring::{rank, Candidate, Preferences, Score, ScoredCandidate, ScoringEngine};
use crate::state::{State, StateDelta};
use crate::step::{Step, StepResult};
use crate::ExecutionContext;

/// How many profiles to read per allowed candidate, so the radius filter
/// still has enough to choose from.
const QUERY_OVERSAMPLE: usize = 5;

const FALLBACK_WHY: &str = "Based on shared interests and proximity.";
const FALLBACK_STARTER: &str = "Hey! Want to connect on CampusConnect?";

/// LLM-written explanation for one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchReasoning {
    pub why_compatible: String,
    pub conversation_starter: String,
    pub adjusted_score: f64,
    /// `false` when the template text stands in for the LLM.
    pub from_llm: bool,
}

impl MatchReasoning {
    fn fallback(score: Score) -> Self {
        Self {
            why_compatible: FALLBACK_WHY.into(),
            conversation_starter: FALLBACK_STARTER.into(),
            adjusted_score: score.value(),
            from_llm: false,
        }
    }

    /// Read an LLM answer; `None` when it lacks an explanation.
    fn parse(answer: &Value, score: Score) -> Option<Self> {
        let why = answer
            .get("why_compatible")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())?;
        let starter = answer
            .get("conversation_starter")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(FALLBACK_STARTER);
        let adjusted = answer
            .get("compatibility_score")
            .and_then(Value::as_f64)
            .map_or(score, Score::clamped);
        Some(Self {
            why_compatible: why.to_string(),
            conversation_starter: starter.to_string(),
            adjusted_score: adjusted.value(),
            from_llm: true,
        })
    }
}

/// One entry of the caller-facing match list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalMatch {
    pub id: String,
    pub name: Option<String>,
    pub major: Option<String>,
    pub year: Option<i64>,
    pub bio: Option<String>,
    pub interests: Vec<String>,
    pub score: f64,
    pub why_compatible: String,
    pub conversation_starter: String,
}

impl FinalMatch {
    fn new(scored: &ScoredCandidate, reasoning: Option<&MatchReasoning>) -> Self {
        let c = &scored.candidate;
        Self {
            id: c.uid.clone(),
            name: c.name.clone(),
            major: c.major.clone(),
            year: c.year,
            bio: c.bio.clone(),
            interests: c.interests.clone(),
            score: reasoning.map_or(scored.score().value(), |r| r.adjusted_score),
            why_compatible: reasoning.map(|r| r.why_compatible.clone()).unwrap_or_default(),
            conversation_starter: reasoning
                .map(|r| r.conversation_starter.clone())
                .unwrap_or_default(),
        }
    }
}

pub(crate) fn build(deps: &Collaborators) -> Result<CompiledGraph> {
    let engine = ScoringEngine::new(deps.config.scoring.clone());
    GraphDefinition::new("matching")
        .add_node("fetch_user_profile", FetchUserProfile::new(deps.clone()))
        .add_node("query_candidates", QueryCandidates { deps: deps.clone() })
        .add_node(
            "filter_candidates",
            FilterCandidates {
                deps: deps.clone(),
                engine: engine.clone(),
            },
        )
        .add_node(
            "score_matches",
            ScoreMatches {
                deps: deps.clone(),
                engine,
            },
        )
        .add_node(
            "rank_top_matches",
            RankTopMatches {
                top_n: deps.config.top_matches,
            },
        )
        .add_node("generate_reasoning", GenerateReasoning { deps: deps.clone() })
        .add_node("finalize_response", FinalizeResponse { deps: deps.clone() })
        .set_entry("fetch_user_profile")
        .add_conditional_edges(
            "fetch_user_profile",
            vec![(EdgeCondition::present("user_profile"), Target::node("query_candidates"))],
            "finalize_response",
        )
        .add_edge("query_candidates", "filter_candidates")
        .add_edge("filter_candidates", "score_matches")
        .add_edge("score_matches", "rank_top_matches")
        .add_conditional_edges(
            "rank_top_matches",
            vec![(EdgeCondition::non_empty("top_matches"), Target::node("generate_reasoning"))],
            "finalize_response",
        )
        .add_edge("generate_reasoning", "finalize_response")
        .set_finish("finalize_response")
        .with_schema(
            InputSchema::new()
                .required("user_id", FieldType::NonEmptyString)
                .required("tenant_id", FieldType::NonEmptyString)
                .optional("preferences", FieldType::Object),
        )
        .compile()
}

fn requester(state: &State) -> std::result::Result<Candidate, StepError> {
    state
        .get_as::<Profile>("user_profile")
        .map(|p| p.candidate)
        .ok_or_else(|| StepError::internal("user_profile missing or unreadable"))
}

/// Request preferences with service defaults filled in.
fn preferences(state: &State, deps: &Collaborators) -> std::result::Result<Preferences, StepError> {
    let mut prefs = match state.value("preferences") {
        None | Some(Value::Null) => Preferences::default(),
        Some(raw) => serde_json::from_value::<Preferences>(raw.clone())
            .map_err(|e| StepError::validation(format!("invalid preferences: {e}")))?,
    };
    prefs.radius_meters.get_or_insert(deps.config.default_radius_meters);
    prefs.max_candidates = prefs.max_candidates.min(deps.config.max_candidates);
    prefs.validate()?;
    Ok(prefs)
}

struct QueryCandidates {
    deps: Collaborators,
}

#[async_trait]
impl Step for QueryCandidates {
    async fn run(&self, ctx: &ExecutionContext, state: &State) -> StepResult {
        let tenant_id = required_str(state, "tenant_id")?;
        let campus_id = state.get_str("campus_id").filter(|c| !c.is_empty());
        let limit = self.deps.config.max_candidates.saturating_mul(QUERY_OVERSAMPLE);

        match self
            .deps
            .fetch(ctx, self.deps.data.fetch_candidates_in_tenant(tenant_id, campus_id, limit))
            .await
        {
            Ok(candidates) => {
                debug!(count = candidates.len(), "Queried candidates");
                Ok(StateDelta::new().set_serialized("candidates", &candidates))
            }
            Err(err) if err.is_recoverable() => {
                warn!(step = self.name(), error = %err, "Candidate query failed");
                let delta = StateDelta::new().set("candidates", json!([]));
                Ok(degrade(ctx, self.name(), "candidate store unavailable", delta))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn name(&self) -> &str {
        "query_candidates"
    }
}

/// Drops existing connections, recent matches and anyone out of range.
struct FilterCandidates {
    deps: Collaborators,
    engine: ScoringEngine,
}

impl FilterCandidates {
    /// Peers to exclude. Store failures shrink the list instead of failing.
    async fn exclusions(
        &self,
        ctx: &ExecutionContext,
        user_id: &str,
        tenant_id: &str,
    ) -> (HashSet<String>, Option<&'static str>) {
        let mut excluded = HashSet::new();
        let mut problem = None;
        let data = &self.deps.data;

        match self.deps.fetch(ctx, data.fetch_connections(user_id, tenant_id)).await {
            Ok(connections) => {
                excluded.extend(connections.excluded().into_iter().map(str::to_string));
            }
            Err(err) => {
                warn!(step = self.name(), error = %err, "Connections unavailable; not excluding them");
                problem = Some("connection history unavailable");
            }
        }

        let days = self.deps.config.recent_match_days;
        match self.deps.fetch(ctx, data.fetch_recent_matches(user_id, days)).await {
            Ok(recent) => excluded.extend(recent.into_iter().map(|m| m.matched_user_id)),
            Err(err) => {
                warn!(step = self.name(), error = %err, "Recent matches unavailable; not excluding them");
                problem = Some("match history unavailable");
            }
        }
        (excluded, problem)
    }
}

#[async_trait]
impl Step for FilterCandidates {
    async fn run(&self, ctx: &ExecutionContext, state: &State) -> StepResult {
        let user_id = required_str(state, "user_id")?;
        let tenant_id = required_str(state, "tenant_id")?;
        let me = requester(state)?;
        let prefs = preferences(state, &self.deps)?;

        let (excluded, problem) = self.exclusions(ctx, user_id, tenant_id).await;
        let eligible: Vec<Candidate> = records::<Candidate>(state, "candidates", self.name())
            .into_iter()
            .filter(|c| !excluded.contains(&c.uid))
            .collect();

        let filtered: Vec<&Candidate> = self.engine.filter_candidates(&me, &eligible, &prefs)?;
        debug!(eligible = eligible.len(), kept = filtered.len(), "Filtered candidates");

        let delta = StateDelta::new().set_serialized("filtered_candidates", &filtered);
        Ok(match problem {
            Some(reason) => degrade(ctx, self.name(), reason, delta),
            None => delta,
        })
    }

    fn name(&self) -> &str {
        "filter_candidates"
    }
}

struct ScoreMatches {
    deps: Collaborators,
    engine: ScoringEngine,
}

#[async_trait]
impl Step for ScoreMatches {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        let me = requester(state)?;
        let prefs = preferences(state, &self.deps)?;
        let filtered = state
            .get_as::<Vec<Candidate>>("filtered_candidates")
            .unwrap_or_default();

        let scored: Vec<ScoredCandidate> = self
            .engine
            .score_all(&me, &filtered, &prefs)
            .into_iter()
            .filter(|s| s.score().value() >= prefs.min_score)
            .collect();
        Ok(StateDelta::new().set_serialized("scored_matches", &scored))
    }

    fn name(&self) -> &str {
        "score_matches"
    }
}

struct RankTopMatches {
    top_n: usize,
}

#[async_trait]
impl Step for RankTopMatches {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        let scored = state
            .get_as::<Vec<ScoredCandidate>>("scored_matches")
            .unwrap_or_default();
        let top = rank(scored, self.top_n);
        Ok(StateDelta::new().set_serialized("top_matches", &top))
    }

    fn name(&self) -> &str {
        "rank_top_matches"
    }
}

/// Profile fields the LLM sees. No ids or coordinates.
fn prompt_view(c: &Candidate) -> Value {
    json!({
        "name": c.name.as_deref().unwrap_or("User"),
        "major": c.major.as_deref().unwrap_or("Unknown"),
        "year": c.year.unwrap_or(0),
        "bio": c.bio.as_deref().unwrap_or(""),
        "interests": c.interests.join(", "),
    })
}

struct GenerateReasoning {
    deps: Collaborators,
}

#[async_trait]
impl Step for GenerateReasoning {
    async fn run(&self, ctx: &ExecutionContext, state: &State) -> StepResult {
        let me = requester(state)?;
        let top = state
            .get_as::<Vec<ScoredCandidate>>("top_matches")
            .unwrap_or_default();

        let mut reasoning: HashMap<String, MatchReasoning> = HashMap::new();
        let mut llm_down = false;
        let mut fell_back = 0usize;

        for scored in &top {
            let score = scored.score();
            let answer = if llm_down {
                None
            } else {
                let input = json!({
                    "requester": prompt_view(&me),
                    "candidate": prompt_view(&scored.candidate),
                    "score": score.value(),
                });
                match self.deps.consult(ctx, self.name(), "matching_reasoning", input).await? {
                    Some(answer) => Some(answer),
                    None => {
                        // Skip the remaining calls instead of burning the budget on them.
                        llm_down = true;
                        None
                    }
                }
            };

            let entry = match answer.as_ref().and_then(|a| MatchReasoning::parse(a, score)) {
                Some(parsed) => parsed,
                None => {
                    if answer.is_some() {
                        warn!(step = self.name(), "LLM answer had no explanation; using template");
                    }
                    fell_back += 1;
                    MatchReasoning::fallback(score)
                }
            };
            reasoning.insert(scored.candidate.uid.clone(), entry);
        }

        let applied = fell_back < top.len();
        let delta = StateDelta::new()
            .set_serialized("llm_reasoning", &reasoning)
            .set("reasoning_applied", applied);
        Ok(if fell_back > 0 {
            degrade(ctx, self.name(), "llm unavailable for match reasoning", delta)
        } else {
            delta
        })
    }

    fn name(&self) -> &str {
        "generate_reasoning"
    }
}

struct FinalizeResponse {
    deps: Collaborators,
}

#[async_trait]
impl Step for FinalizeResponse {
    async fn run(&self, ctx: &ExecutionContext, state: &State) -> StepResult {
        let top = state
            .get_as::<Vec<ScoredCandidate>>("top_matches")
            .unwrap_or_default();
        let reasoning = state
            .get_as::<HashMap<String, MatchReasoning>>("llm_reasoning")
            .unwrap_or_default();

        let finals: Vec<FinalMatch> = top
            .iter()
            .map(|s| FinalMatch::new(s, reasoning.get(&s.candidate.uid)))
            .collect();

        let mut persisted = 0usize;
        if let (Some(user_id), Some(tenant_id)) = (state.get_str("user_id"), state.get_str("tenant_id")) {
            for m in &finals {
                let record = MatchRecord {
                    user_id: user_id.to_string(),
                    matched_user_id: m.id.clone(),
                    tenant_id: tenant_id.to_string(),
                    score: m.score,
                    why_compatible: Some(m.why_compatible.clone()),
                    conversation_starter: Some(m.conversation_starter.clone()),
                    created_at: Utc::now(),
                };
                match self.deps.fetch(ctx, self.deps.data.save_match(record)).await {
                    Ok(()) => persisted += 1,
                    Err(err) => warn!(step = self.name(), error = %err, "Failed to save match"),
                }
            }
        }

        let metadata = json!({
            "reasoning_applied": state.get_bool("reasoning_applied").unwrap_or(false),
            "total_candidates": state.get_array("candidates").map_or(0, Vec::len),
            "filtered_count": state.get_array("filtered_candidates").map_or(0, Vec::len),
            "returned": finals.len(),
            "persisted": persisted,
        });
        Ok(StateDelta::new()
            .set_serialized("final_matches", &finals)
            .set("response_metadata", metadata))
    }

    fn name(&self) -> &str {
        "finalize_response"
    }
}

/// Caller-facing result. Runs that stopped before finalizing fall back to
/// the deterministic ranking, if one was committed.
pub(crate) fn project(state: &State) -> Value {
    let matches = match state.value("final_matches") {
        Some(finals) => finals.clone(),
        None => {
            let top = state
                .get_as::<Vec<ScoredCandidate>>("top_matches")
                .unwrap_or_default();
            let finals: Vec<FinalMatch> = top.iter().map(|s| FinalMatch::new(s, None)).collect();
            serde_json::to_value(finals).unwrap_or_else(|_| json!([]))
        }
    };
    json!({
        "matches": matches,
        "metadata": state.get("response_metadata", Value::Null),
    })
}
