//! Input schemas validated once at run entry.
//!
//! Each pipeline declares which initial fields it needs and their types, so
//! steps further down can rely on them being present and well-formed.
//! Schemas are closed: any undeclared field is rejected, so a caller cannot
//! preset fields that steps write, such as `user_profile` or `degraded`.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::state::State;

/// The JSON shape a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    NonEmptyString,
    Number,
    Integer,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::NonEmptyString => value.as_str().is_some_and(|s| !s.trim().is_empty()),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            FieldType::String => "a string",
            FieldType::NonEmptyString => "a non-empty string",
            FieldType::Number => "a number",
            FieldType::Integer => "an integer",
            FieldType::Bool => "a boolean",
            FieldType::Object => "an object",
            FieldType::Array => "an array",
            FieldType::Any => "any value",
        }
    }
}

#[derive(Debug, Clone)]
struct FieldRule {
    name: String,
    ty: FieldType,
    required: bool,
    one_of: Option<Vec<String>>,
}

/// Declared input fields for one pipeline.
///
/// # Example
///
/// ```rust
/// use campus_agents::schema::{FieldType, InputSchema};
/// use campus_agents::{State, StateDelta};
///
/// let schema = InputSchema::new()
///     .required("user_id", FieldType::NonEmptyString)
///     .optional("preferences", FieldType::Object);
///
/// let ok = State::new().merge(StateDelta::new().set("user_id", "u1"));
/// assert!(schema.validate(&ok).is_ok());
/// assert!(schema.validate(&State::new()).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InputSchema {
    rules: Vec<FieldRule>,
}

impl InputSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `name` to be present with type `ty`.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.rules.push(FieldRule {
            name: name.into(),
            ty,
            required: true,
            one_of: None,
        });
        self
    }

    /// Allow `name`; when present and not `null` it must have type `ty`.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.rules.push(FieldRule {
            name: name.into(),
            ty,
            required: false,
            one_of: None,
        });
        self
    }

    /// Restrict the most recently declared string field to a fixed set.
    #[must_use]
    pub fn one_of(mut self, allowed: &[&str]) -> Self {
        if let Some(rule) = self.rules.last_mut() {
            rule.one_of = Some(allowed.iter().map(|s| s.to_string()).collect());
        }
        self
    }

    /// Check `state` against every rule, reporting the first violation.
    pub fn validate(&self, state: &State) -> Result<()> {
        if let Some(field) = state
            .keys()
            .find(|key| !self.rules.iter().any(|r| r.name == *key))
        {
            return Err(Error::Validation(format!(
                "field '{field}' is not an accepted input"
            )));
        }

        for rule in &self.rules {
            let value = match state.value(&rule.name) {
                Some(Value::Null) | None if rule.required => {
                    return Err(Error::Validation(format!(
                        "missing required field '{}'",
                        rule.name
                    )));
                }
                Some(Value::Null) | None => continue,
                Some(value) => value,
            };

            if !rule.ty.accepts(value) {
                return Err(Error::Validation(format!(
                    "field '{}' must be {}",
                    rule.name,
                    rule.ty.describe()
                )));
            }

            if let (Some(allowed), Some(s)) = (&rule.one_of, value.as_str()) {
                if !allowed.iter().any(|a| a == s) {
                    return Err(Error::Validation(format!(
                        "field '{}' must be one of: {}",
                        rule.name,
                        allowed.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateDelta;
    use serde_json::json;

    fn schema() -> InputSchema {
        InputSchema::new()
            .required("user_id", FieldType::NonEmptyString)
            .required("tenant_id", FieldType::String)
            .optional("request_type", FieldType::String)
            .one_of(&["events", "communities"])
            .optional("limit", FieldType::Integer)
    }

    #[test]
    fn test_missing_required_field() {
        let s = State::new().merge(StateDelta::new().set("user_id", "u1"));
        let err = schema().validate(&s).unwrap_err();
        assert!(err.to_string().contains("tenant_id"));
    }

    #[test]
    fn test_blank_string_rejected() {
        let s = State::new().merge(StateDelta::new().set("user_id", "  ").set("tenant_id", "t"));
        assert!(matches!(schema().validate(&s), Err(Error::Validation(_))));
    }

    #[test]
    fn test_optional_type_and_enumeration() {
        let base = StateDelta::new().set("user_id", "u1").set("tenant_id", "t1");
        let s = State::new().merge(base.clone().set("request_type", "events"));
        assert!(schema().validate(&s).is_ok());

        let s = State::new().merge(base.clone().set("request_type", "parties"));
        assert!(schema().validate(&s).is_err());

        let s = State::new().merge(base.clone().set("limit", json!(2.5)));
        assert!(schema().validate(&s).is_err());

        let s = State::new().merge(base.set("limit", Value::Null));
        assert!(schema().validate(&s).is_ok());
    }

    #[test]
    fn test_undeclared_field_rejected() {
        let s = State::new().merge(
            StateDelta::new()
                .set("user_id", "u1")
                .set("tenant_id", "t1")
                .set("degraded", true),
        );
        let err = schema().validate(&s).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("degraded"));
    }
}
