//! The state container threaded through every step of a run.
//!
//! [`State`] is immutable: [`State::merge`] returns a new container and leaves
//! the receiver untouched, so anything still holding an older snapshot keeps a
//! consistent view. Merges are shallow and replace whole field values.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name written by steps that fell back to a deterministic result.
pub const DEGRADED_FIELD: &str = "degraded";
/// Companion field carrying the reason for degraded mode.
pub const DEGRADED_REASON_FIELD: &str = "degraded_reason";

/// An immutable mapping from field name to JSON value.
///
/// # Example
///
/// ```rust
/// use campus_agents::{State, StateDelta};
/// use serde_json::json;
///
/// let before = State::new().merge(StateDelta::new().set("user_id", "u1"));
/// let after = before.merge(StateDelta::new().set("user_id", "u2").set("count", 3));
///
/// assert_eq!(before.get_str("user_id"), Some("u1"));
/// assert_eq!(after.get_str("user_id"), Some("u2"));
/// assert_eq!(after.get("missing", json!(0)), json!(0));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    fields: Arc<BTreeMap<String, Value>>,
}

impl State {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a JSON object.
    #[must_use]
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            fields: Arc::new(map.into_iter().collect()),
        }
    }

    /// Apply a set of whole-field replacements, returning the new state.
    #[must_use]
    pub fn merge(&self, delta: StateDelta) -> State {
        if delta.is_empty() {
            return self.clone();
        }
        let mut fields = (*self.fields).clone();
        for (key, value) in delta.fields {
            fields.insert(key, value);
        }
        State {
            fields: Arc::new(fields),
        }
    }

    /// Read a field, or return `default` when it is absent.
    pub fn get(&self, field: &str, default: Value) -> Value {
        self.fields.get(field).cloned().unwrap_or(default)
    }

    /// Borrow a field's raw value.
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Whether a field is present (even if `null`).
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(Value::as_f64)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.fields.get(field).and_then(Value::as_bool)
    }

    pub fn get_array(&self, field: &str) -> Option<&Vec<Value>> {
        self.fields.get(field).and_then(Value::as_array)
    }

    pub fn get_object(&self, field: &str) -> Option<&Map<String, Value>> {
        self.fields.get(field).and_then(Value::as_object)
    }

    /// Deserialize a field into `T`. Missing or mistyped fields yield `None`.
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Option<T> {
        self.fields
            .get(field)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Whether a step marked this run as degraded.
    pub fn is_degraded(&self) -> bool {
        self.get_bool(DEGRADED_FIELD).unwrap_or(false)
    }

    /// Iterate field names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Copy the state out as a JSON object.
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Serialize for State {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for State {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Ok(State {
            fields: Arc::new(fields),
        })
    }
}

/// Field replacements returned by a step, applied in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    fields: Vec<(String, Value)>,
}

impl StateDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field replacement. Later writes to the same field win.
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Add a field replacement in place.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.push((field.into(), value.into()));
    }

    /// Serialize `value` into a field. Serialization failures write `null`.
    #[must_use]
    pub fn set_serialized<T: Serialize>(self, field: impl Into<String>, value: &T) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.set(field, value)
    }

    /// Mark the run as degraded with a reason.
    #[must_use]
    pub fn degraded(self, reason: impl Into<String>) -> Self {
        self.set(DEGRADED_FIELD, true)
            .set(DEGRADED_REASON_FIELD, reason.into())
    }

    /// Names of the fields this delta writes.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.fields.len());
        for (key, _) in &self.fields {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}
