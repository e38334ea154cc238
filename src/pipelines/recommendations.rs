//! Recommendations: suggest campus events or communities to one user.
//!
//! ```text
//! fetch_user_profile -[profile]-> query_events_and_groups -> rank_events
//!     -> rank_groups -> generate_reasoning -> finalize_recommendations
//! ```
//!
//! Also served under its legacy name `events_communities`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{degrade, records, required_str, Collaborators, FetchUserProfile};
use crate::data::{Event, Group, Profile};
use crate::error::Result;
use crate::graph::{CompiledGraph, EdgeCondition, GraphDefinition, Target};
use crate::schema::{FieldType, InputSchema};
use crate::state::{State, StateDelta};
use crate::step::{Step, StepResult};
use crate::ExecutionContext;

const BASE_SCORE: f64 = 50.0;
const SOON_WINDOW_HOURS: i64 = 72;

/// Event relevance: category match, starting within three days, attendance.
pub fn score_event(event: &Event, interests: &HashSet<&str>, now: DateTime<Utc>) -> f64 {
    let mut score = BASE_SCORE;
    if event
        .category
        .as_deref()
        .is_some_and(|c| interests.contains(c))
    {
        score += 15.0;
    }
    if let Some(start) = event.start_time {
        let until = start - now;
        if until >= ChronoDuration::zero() && until <= ChronoDuration::hours(SOON_WINDOW_HOURS) {
            score += 10.0;
        }
    }
    score + (event.attendees_count as f64 / 10.0).min(15.0)
}

/// Group relevance: shared tags and member count.
pub fn score_group(group: &Group, interests: &HashSet<&str>) -> f64 {
    let common = group
        .tags
        .iter()
        .map(String::as_str)
        .collect::<HashSet<_>>()
        .intersection(interests)
        .count();
    BASE_SCORE + (common as f64 * 5.0).min(20.0) + (group.member_count as f64 / 50.0).min(15.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEvent {
    #[serde(flatten)]
    pub event: Event,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedGroup {
    #[serde(flatten)]
    pub group: Group,
    pub score: f64,
}

fn by_score_then_id(a: (f64, &str), b: (f64, &str)) -> Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1))
}

/// What the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestType {
    Events,
    Communities,
}

impl RequestType {
    fn of(state: &State) -> Self {
        match state.get_str("request_type") {
            Some("communities") => RequestType::Communities,
            _ => RequestType::Events,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RequestType::Events => "events",
            RequestType::Communities => "communities",
        }
    }
}

fn interests(state: &State) -> Vec<String> {
    state
        .get_as::<Profile>("user_profile")
        .map(|p| p.candidate.interests)
        .unwrap_or_default()
}

pub(crate) fn build(deps: &Collaborators) -> Result<CompiledGraph> {
    let top_n = deps.config.top_matches;
    GraphDefinition::new("recommendations")
        .add_node("fetch_user_profile", FetchUserProfile::new(deps.clone()))
        .add_node("query_events_and_groups", QueryEventsAndGroups { deps: deps.clone() })
        .add_node("rank_events", RankEvents { top_n })
        .add_node("rank_groups", RankGroups { top_n })
        .add_node("generate_reasoning", GenerateReasoning { deps: deps.clone() })
        .add_node("finalize_recommendations", FinalizeRecommendations)
        .set_entry("fetch_user_profile")
        .add_conditional_edges(
            "fetch_user_profile",
            vec![(
                EdgeCondition::present("user_profile"),
                Target::node("query_events_and_groups"),
            )],
            "finalize_recommendations",
        )
        .add_edge("query_events_and_groups", "rank_events")
        .add_edge("rank_events", "rank_groups")
        .add_edge("rank_groups", "generate_reasoning")
        .add_edge("generate_reasoning", "finalize_recommendations")
        .set_finish("finalize_recommendations")
        .with_schema(
            InputSchema::new()
                .required("user_id", FieldType::NonEmptyString)
                .required("tenant_id", FieldType::NonEmptyString)
                .optional("request_type", FieldType::String)
                .one_of(&["events", "communities"])
                .optional("filters", FieldType::Object),
        )
        .compile()
}

struct QueryEventsAndGroups {
    deps: Collaborators,
}

#[async_trait]
impl Step for QueryEventsAndGroups {
    async fn run(&self, ctx: &ExecutionContext, state: &State) -> StepResult {
        let tenant_id = required_str(state, "tenant_id")?;
        let data = &self.deps.data;

        let events = self.deps.fetch(ctx, data.fetch_events(tenant_id)).await;
        let groups = self.deps.fetch(ctx, data.fetch_groups(tenant_id)).await;
        let mut unavailable = false;

        let events = match events {
            Ok(events) => events,
            Err(err) if err.is_recoverable() => {
                warn!(step = self.name(), error = %err, "Events unavailable");
                unavailable = true;
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };
        let groups = match groups {
            Ok(groups) => groups,
            Err(err) if err.is_recoverable() => {
                warn!(step = self.name(), error = %err, "Groups unavailable");
                unavailable = true;
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };
        debug!(events = events.len(), groups = groups.len(), "Queried events and groups");

        let delta = StateDelta::new()
            .set_serialized("events", &events)
            .set_serialized("groups", &groups);
        Ok(if unavailable {
            degrade(ctx, self.name(), "event store unavailable", delta)
        } else {
            delta
        })
    }

    fn name(&self) -> &str {
        "query_events_and_groups"
    }
}

struct RankEvents {
    top_n: usize,
}

#[async_trait]
impl Step for RankEvents {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        let tags = interests(state);
        let tags: HashSet<&str> = tags.iter().map(String::as_str).collect();
        let now = Utc::now();

        let mut ranked: Vec<RankedEvent> = records::<Event>(state, "events", self.name())
            .into_iter()
            .map(|event| RankedEvent {
                score: score_event(&event, &tags, now),
                event,
            })
            .collect();
        ranked.sort_by(|a, b| by_score_then_id((a.score, &a.event.id), (b.score, &b.event.id)));
        ranked.truncate(self.top_n);
        Ok(StateDelta::new().set_serialized("ranked_events", &ranked))
    }

    fn name(&self) -> &str {
        "rank_events"
    }
}

struct RankGroups {
    top_n: usize,
}

#[async_trait]
impl Step for RankGroups {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        let tags = interests(state);
        let tags: HashSet<&str> = tags.iter().map(String::as_str).collect();

        let mut ranked: Vec<RankedGroup> = records::<Group>(state, "groups", self.name())
            .into_iter()
            .map(|group| RankedGroup {
                score: score_group(&group, &tags),
                group,
            })
            .collect();
        ranked.sort_by(|a, b| by_score_then_id((a.score, &a.group.id), (b.score, &b.group.id)));
        ranked.truncate(self.top_n);
        Ok(StateDelta::new().set_serialized("ranked_groups", &ranked))
    }

    fn name(&self) -> &str {
        "rank_groups"
    }
}

fn chosen(state: &State) -> Vec<Value> {
    let field = match RequestType::of(state) {
        RequestType::Events => "ranked_events",
        RequestType::Communities => "ranked_groups",
    };
    state.get_array(field).cloned().unwrap_or_default()
}

struct GenerateReasoning {
    deps: Collaborators,
}

#[async_trait]
impl Step for GenerateReasoning {
    async fn run(&self, ctx: &ExecutionContext, state: &State) -> StepResult {
        let candidates = chosen(state);
        if candidates.is_empty() {
            return Ok(StateDelta::new().set("reasoning", json!({})));
        }

        let input = json!({
            "interests": interests(state),
            "request_type": RequestType::of(state).as_str(),
            "candidates": candidates,
        });
        let answer = self
            .deps
            .consult(ctx, self.name(), "recommendations_reasoning", input)
            .await?;

        let reasons: Option<HashMap<String, String>> = answer
            .as_ref()
            .and_then(|a| a.get("reasons"))
            .and_then(|r| serde_json::from_value(r.clone()).ok());
        match reasons {
            Some(reasons) => Ok(StateDelta::new().set_serialized("reasoning", &reasons)),
            None => {
                let delta = StateDelta::new().set("reasoning", json!({}));
                Ok(degrade(ctx, self.name(), "llm unavailable for recommendation reasons", delta))
            }
        }
    }

    fn name(&self) -> &str {
        "generate_reasoning"
    }
}

struct FinalizeRecommendations;

#[async_trait]
impl Step for FinalizeRecommendations {
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        let reasons = state
            .get_as::<HashMap<String, String>>("reasoning")
            .unwrap_or_default();
        let enriched: Vec<Value> = chosen(state)
            .into_iter()
            .map(|mut item| {
                let reason = item
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|id| reasons.get(id))
                    .cloned()
                    .unwrap_or_default();
                if let Value::Object(map) = &mut item {
                    map.insert("reason".into(), Value::String(reason));
                }
                item
            })
            .collect();
        Ok(StateDelta::new()
            .set("request_type", RequestType::of(state).as_str())
            .set("ranked_recommendations", Value::Array(enriched)))
    }

    fn name(&self) -> &str {
        "finalize_recommendations"
    }
}

pub(crate) fn project(state: &State) -> Value {
    json!({
        "request_type": RequestType::of(state).as_str(),
        "recommendations": state.get("ranked_recommendations", json!([])),
    })
}
