//! The document-store contract pipelines read profiles and history through.
//!
//! All reads and writes are scoped by tenant. [`InMemoryStore`] is the
//! reference implementation used by tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::scoring::Candidate;

/// Failures of the document store, as seen by steps.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// The store could not be reached. Recoverable: pipelines degrade.
    #[error("Data store unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A stored document could not be read.
    #[error("Malformed document: {0}")]
    Malformed(String),
}

impl DataError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DataError::Unavailable(_))
    }
}

/// A stored user profile: the scoring view plus its tenant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(flatten)]
    pub candidate: Candidate,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl Profile {
    pub fn new(uid: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            candidate: Candidate::new(uid),
            tenant_id: Some(tenant_id.into()),
        }
    }

    pub fn uid(&self) -> &str {
        &self.candidate.uid
    }
}

/// A persisted match suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    pub user_id: String,
    pub matched_user_id: String,
    pub tenant_id: String,
    pub score: f64,
    #[serde(default)]
    pub why_compatible: Option<String>,
    #[serde(default)]
    pub conversation_starter: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attendees_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub member_count: u64,
}

/// A user's existing connections, by peer id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connections {
    #[serde(default)]
    pub accepted: Vec<String>,
    #[serde(default)]
    pub pending: Vec<String>,
    #[serde(default)]
    pub blocked: Vec<String>,
}

impl Connections {
    /// Every peer that must not be suggested again.
    pub fn excluded(&self) -> HashSet<&str> {
        self.accepted
            .iter()
            .chain(&self.pending)
            .chain(&self.blocked)
            .map(String::as_str)
            .collect()
    }
}

/// "Fetch by id, query by tenant, save record."
#[async_trait]
pub trait DataGateway: Send + Sync {
    async fn fetch_profile(&self, user_id: &str, tenant_id: &str) -> Result<Option<Profile>, DataError>;

    /// Profiles in the tenant, optionally limited to one campus, at most `limit`.
    async fn fetch_candidates_in_tenant(
        &self,
        tenant_id: &str,
        campus_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>, DataError>;

    /// Matches suggested to `user_id` within the last `days` days.
    async fn fetch_recent_matches(&self, user_id: &str, days: u32) -> Result<Vec<MatchRecord>, DataError>;

    async fn fetch_connections(&self, user_id: &str, tenant_id: &str) -> Result<Connections, DataError>;

    async fn save_match(&self, record: MatchRecord) -> Result<(), DataError>;

    /// Merge `fields` into the stored profile, creating it if absent.
    async fn save_profile_fields(
        &self,
        user_id: &str,
        tenant_id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), DataError>;

    async fn fetch_events(&self, tenant_id: &str) -> Result<Vec<Event>, DataError>;

    async fn fetch_groups(&self, tenant_id: &str) -> Result<Vec<Group>, DataError>;
}

#[derive(Default)]
struct StoreInner {
    /// Raw profile documents keyed by (tenant, uid).
    profiles: HashMap<(String, String), Map<String, Value>>,
    matches: Vec<MatchRecord>,
    connections: HashMap<(String, String), Connections>,
    events: HashMap<String, Vec<Event>>,
    groups: HashMap<String, Vec<Group>>,
}

/// Tenant-scoped store held in memory.
///
/// Profiles are kept as raw documents so partial onboarding writes merge the
/// same way a document store would.
pub struct InMemoryStore {
    inner: RwLock<StoreInner>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with [`DataError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DataError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DataError::Unavailable("in-memory store is offline".into()))
        }
    }

    pub async fn insert_profile(&self, tenant_id: &str, document: Value) -> Result<(), DataError> {
        let Value::Object(map) = document else {
            return Err(DataError::Malformed("profile must be an object".into()));
        };
        let uid = map
            .get("uid")
            .or_else(|| map.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| DataError::Malformed("profile has no uid".into()))?
            .to_string();
        self.inner
            .write()
            .await
            .profiles
            .insert((tenant_id.to_string(), uid), map);
        Ok(())
    }

    pub async fn set_connections(&self, user_id: &str, tenant_id: &str, connections: Connections) {
        self.inner
            .write()
            .await
            .connections
            .insert((tenant_id.to_string(), user_id.to_string()), connections);
    }

    pub async fn insert_event(&self, tenant_id: &str, event: Event) {
        self.inner
            .write()
            .await
            .events
            .entry(tenant_id.to_string())
            .or_default()
            .push(event);
    }

    pub async fn insert_group(&self, tenant_id: &str, group: Group) {
        self.inner
            .write()
            .await
            .groups
            .entry(tenant_id.to_string())
            .or_default()
            .push(group);
    }

    /// Every match saved so far, oldest first.
    pub async fn saved_matches(&self) -> Vec<MatchRecord> {
        self.inner.read().await.matches.clone()
    }

    /// The raw stored document, for inspecting onboarding writes.
    pub async fn profile_document(&self, user_id: &str, tenant_id: &str) -> Option<Map<String, Value>> {
        self.inner
            .read()
            .await
            .profiles
            .get(&(tenant_id.to_string(), user_id.to_string()))
            .cloned()
    }
}

fn parse_profile(document: &Map<String, Value>) -> Result<Profile, DataError> {
    serde_json::from_value(Value::Object(document.clone()))
        .map_err(|e| DataError::Malformed(e.to_string()))
}

#[async_trait]
impl DataGateway for InMemoryStore {
    async fn fetch_profile(&self, user_id: &str, tenant_id: &str) -> Result<Option<Profile>, DataError> {
        self.check()?;
        let inner = self.inner.read().await;
        match inner.profiles.get(&(tenant_id.to_string(), user_id.to_string())) {
            Some(document) => {
                let mut profile = parse_profile(document)?;
                profile.tenant_id.get_or_insert_with(|| tenant_id.to_string());
                Ok(Some(profile))
            }
            None => Ok(None),
        }
    }

    async fn fetch_candidates_in_tenant(
        &self,
        tenant_id: &str,
        campus_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>, DataError> {
        self.check()?;
        let inner = self.inner.read().await;
        let mut candidates: Vec<Candidate> = inner
            .profiles
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id)
            .filter_map(|((_, uid), document)| match parse_profile(document) {
                Ok(profile) => Some(profile.candidate),
                Err(e) => {
                    debug!(uid = %uid, error = %e, "Skipping unreadable profile");
                    None
                }
            })
            .filter(|c| match campus_id {
                Some(campus) => c.campus_id.as_deref() == Some(campus),
                None => true,
            })
            .collect();
        candidates.sort_by(|a, b| a.uid.cmp(&b.uid));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn fetch_recent_matches(&self, user_id: &str, days: u32) -> Result<Vec<MatchRecord>, DataError> {
        self.check()?;
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let inner = self.inner.read().await;
        Ok(inner
            .matches
            .iter()
            .filter(|m| m.user_id == user_id && m.created_at >= cutoff)
            .cloned()
            .collect())
    }

    async fn fetch_connections(&self, user_id: &str, tenant_id: &str) -> Result<Connections, DataError> {
        self.check()?;
        let inner = self.inner.read().await;
        Ok(inner
            .connections
            .get(&(tenant_id.to_string(), user_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn save_match(&self, record: MatchRecord) -> Result<(), DataError> {
        self.check()?;
        self.inner.write().await.matches.push(record);
        Ok(())
    }

    async fn save_profile_fields(
        &self,
        user_id: &str,
        tenant_id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), DataError> {
        self.check()?;
        let mut inner = self.inner.write().await;
        let document = inner
            .profiles
            .entry((tenant_id.to_string(), user_id.to_string()))
            .or_insert_with(|| {
                let mut doc = Map::new();
                doc.insert("uid".into(), Value::String(user_id.to_string()));
                doc
            });
        document.extend(fields);
        document.insert("tenantId".into(), Value::String(tenant_id.to_string()));
        Ok(())
    }

    async fn fetch_events(&self, tenant_id: &str) -> Result<Vec<Event>, DataError> {
        self.check()?;
        Ok(self.inner.read().await.events.get(tenant_id).cloned().unwrap_or_default())
    }

    async fn fetch_groups(&self, tenant_id: &str) -> Result<Vec<Group>, DataError> {
        self.check()?;
        Ok(self.inner.read().await.groups.get(tenant_id).cloned().unwrap_or_default())
    }
}
