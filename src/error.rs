//! Error types for pipeline definition and execution.
//!
//! Two layers live here. [`Error`] is what the crate's fallible APIs return
//! (compiling a graph, loading configuration, validating input). [`StepError`]
//! is what a step hands back to the executor: a classified [`ErrorKind`] plus
//! a message, with every collaborator-specific detail already folded away.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::DataError;
use crate::provider::LlmError;

/// Classification of every failure a run can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The graph was compiled from an invalid definition.
    DefinitionError,
    /// The initial state does not match the pipeline's input schema.
    ValidationError,
    /// The data store or the LLM could not be reached.
    CollaboratorUnavailable,
    /// The run deadline was exceeded.
    Timeout,
    /// Anything unanticipated.
    Internal,
}

impl ErrorKind {
    /// Fatal kinds are never retried and never downgraded to degraded mode.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::DefinitionError | ErrorKind::Internal)
    }

    /// The wire name, e.g. `"validation_error"`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DefinitionError => "definition_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::CollaboratorUnavailable => "collaborator_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type for crate operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A pipeline graph definition is invalid.
    #[error("Definition error: {0}")]
    Definition(String),

    /// Input failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A collaborator could not be reached.
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    /// Configuration is missing or inconsistent.
    #[error("Config error: {0}")]
    Config(String),

    /// An unanticipated failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML parse error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// An I/O error while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map this error onto the run-level taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Definition(_) | Error::Config(_) => ErrorKind::DefinitionError,
            Error::Validation(_) | Error::Json(_) => ErrorKind::ValidationError,
            Error::Unavailable(_) => ErrorKind::CollaboratorUnavailable,
            Error::Toml(_) | Error::Io(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// A specialized `Result` type for crate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A classified step failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    /// Which part of the taxonomy this failure belongs to.
    pub kind: ErrorKind,
    /// Human-readable detail. Must not contain user data.
    pub message: String,
}

impl StepError {
    /// Create a step error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for an [`ErrorKind::Internal`] failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Shorthand for an [`ErrorKind::ValidationError`] failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    /// Shorthand for an [`ErrorKind::CollaboratorUnavailable`] failure.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CollaboratorUnavailable, message)
    }
}

impl From<Error> for StepError {
    fn from(err: Error) -> Self {
        StepError::new(err.kind(), err.to_string())
    }
}

impl From<DataError> for StepError {
    fn from(err: DataError) -> Self {
        match err {
            DataError::Unavailable(_) => StepError::unavailable(err.to_string()),
            DataError::NotFound(_) => StepError::validation(err.to_string()),
            DataError::Malformed(_) => StepError::internal(err.to_string()),
        }
    }
}

impl From<LlmError> for StepError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::NotConfigured => StepError::internal(err.to_string()),
            LlmError::CallFailed(_) | LlmError::TimedOut(_) => {
                StepError::unavailable(err.to_string())
            }
            LlmError::Malformed(_) => StepError::internal(err.to_string()),
        }
    }
}
