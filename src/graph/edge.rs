//! Edge targets, conditions and per-node routing.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::state::State;

/// Where a route leads: another node or the terminal sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Node(String),
    End,
}

impl Target {
    /// Target a named node.
    pub fn node(name: impl Into<String>) -> Self {
        Target::Node(name.into())
    }

    /// The node name, or `None` for [`Target::End`].
    pub fn as_node(&self) -> Option<&str> {
        match self {
            Target::Node(name) => Some(name),
            Target::End => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Node(name) => f.write_str(name),
            Target::End => f.write_str("__end__"),
        }
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::node(name)
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Node(name)
    }
}

/// A pure predicate over the current state.
pub type Predicate = Arc<dyn Fn(&State) -> bool + Send + Sync>;

/// A tagged condition guarding a conditional edge.
///
/// Conditions never fail: a missing or mistyped field simply does not match
/// (except for [`EdgeCondition::Absent`], [`EdgeCondition::Falsy`] and
/// [`EdgeCondition::Empty`], which match it).
#[derive(Clone)]
pub enum EdgeCondition {
    /// Field equals the given JSON value.
    Equals { field: String, value: Value },
    /// Field is present and differs from the given JSON value.
    NotEquals { field: String, value: Value },
    /// Field is `true`, a non-zero number, a non-empty string or collection.
    Truthy { field: String },
    /// Field is missing or not truthy.
    Falsy { field: String },
    /// Field is present and not `null`.
    Present { field: String },
    /// Field is missing or `null`.
    Absent { field: String },
    /// Numeric field is `>= threshold`.
    AtLeast { field: String, threshold: f64 },
    /// Numeric field is `< threshold`.
    Below { field: String, threshold: f64 },
    /// Array, object or string field has at least one element.
    NonEmpty { field: String },
    /// Field is missing, `null`, or an empty array, object or string.
    Empty { field: String },
    /// An arbitrary pure predicate, labelled for logs.
    Custom { label: String, predicate: Predicate },
}

impl EdgeCondition {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        EdgeCondition::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn not_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        EdgeCondition::NotEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn truthy(field: impl Into<String>) -> Self {
        EdgeCondition::Truthy { field: field.into() }
    }

    pub fn falsy(field: impl Into<String>) -> Self {
        EdgeCondition::Falsy { field: field.into() }
    }

    pub fn present(field: impl Into<String>) -> Self {
        EdgeCondition::Present { field: field.into() }
    }

    pub fn absent(field: impl Into<String>) -> Self {
        EdgeCondition::Absent { field: field.into() }
    }

    pub fn at_least(field: impl Into<String>, threshold: f64) -> Self {
        EdgeCondition::AtLeast {
            field: field.into(),
            threshold,
        }
    }

    pub fn below(field: impl Into<String>, threshold: f64) -> Self {
        EdgeCondition::Below {
            field: field.into(),
            threshold,
        }
    }

    pub fn non_empty(field: impl Into<String>) -> Self {
        EdgeCondition::NonEmpty { field: field.into() }
    }

    pub fn empty(field: impl Into<String>) -> Self {
        EdgeCondition::Empty { field: field.into() }
    }

    /// Wrap a closure as a labelled condition.
    pub fn custom<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&State) -> bool + Send + Sync + 'static,
    {
        EdgeCondition::Custom {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Evaluate this condition against `state`.
    pub fn matches(&self, state: &State) -> bool {
        match self {
            EdgeCondition::Equals { field, value } => state.value(field) == Some(value),
            EdgeCondition::NotEquals { field, value } => {
                state.value(field).is_some_and(|v| v != value)
            }
            EdgeCondition::Truthy { field } => state.value(field).is_some_and(is_truthy),
            EdgeCondition::Falsy { field } => !state.value(field).is_some_and(is_truthy),
            EdgeCondition::Present { field } => {
                state.value(field).is_some_and(|v| !v.is_null())
            }
            EdgeCondition::Absent { field } => state.value(field).map_or(true, Value::is_null),
            EdgeCondition::AtLeast { field, threshold } => {
                state.get_f64(field).is_some_and(|n| n >= *threshold)
            }
            EdgeCondition::Below { field, threshold } => {
                state.get_f64(field).is_some_and(|n| n < *threshold)
            }
            EdgeCondition::NonEmpty { field } => state.value(field).is_some_and(has_elements),
            EdgeCondition::Empty { field } => !state.value(field).is_some_and(has_elements),
            EdgeCondition::Custom { predicate, .. } => predicate(state),
        }
    }
}

impl fmt::Debug for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeCondition::Equals { field, value } => write!(f, "{field} == {value}"),
            EdgeCondition::NotEquals { field, value } => write!(f, "{field} != {value}"),
            EdgeCondition::Truthy { field } => write!(f, "truthy({field})"),
            EdgeCondition::Falsy { field } => write!(f, "falsy({field})"),
            EdgeCondition::Present { field } => write!(f, "present({field})"),
            EdgeCondition::Absent { field } => write!(f, "absent({field})"),
            EdgeCondition::AtLeast { field, threshold } => write!(f, "{field} >= {threshold}"),
            EdgeCondition::Below { field, threshold } => write!(f, "{field} < {threshold}"),
            EdgeCondition::NonEmpty { field } => write!(f, "non_empty({field})"),
            EdgeCondition::Empty { field } => write!(f, "empty({field})"),
            EdgeCondition::Custom { label, .. } => write!(f, "custom({label})"),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|x| x != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn has_elements(value: &Value) -> bool {
    match value {
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => false,
    }
}

/// Outgoing routing of one node.
#[derive(Debug, Clone)]
pub enum Routing {
    /// Always go to the target.
    Always(Target),
    /// First matching branch wins; `default` is taken when none match.
    Conditional {
        branches: Vec<(EdgeCondition, Target)>,
        default: Target,
    },
}

impl Routing {
    /// Resolve the successor for `state`. Total by construction.
    pub fn resolve(&self, state: &State) -> &Target {
        match self {
            Routing::Always(target) => target,
            Routing::Conditional { branches, default } => branches
                .iter()
                .find(|(condition, _)| condition.matches(state))
                .map(|(_, target)| target)
                .unwrap_or(default),
        }
    }

    /// Every target this routing can ever produce, in declared order.
    pub fn targets(&self) -> Vec<&Target> {
        match self {
            Routing::Always(target) => vec![target],
            Routing::Conditional { branches, default } => branches
                .iter()
                .map(|(_, target)| target)
                .chain(std::iter::once(default))
                .collect(),
        }
    }
}
