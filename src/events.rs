//! Structured run events for tracing and observability.
//!
//! Events are recorded on the [`ExecutionContext`](crate::ExecutionContext)
//! as the executor walks a graph, so callers can inspect which path a run
//! took and where it stopped without scraping log lines.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ErrorKind;

/// Events that can be emitted during a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RunEvent {
    /// A step has started.
    StepStarted {
        /// Name of the step being executed.
        step: String,
    },
    /// A step returned a delta that was merged into the state.
    StepCompleted {
        /// Name of the step that completed.
        step: String,
        /// Duration of execution in milliseconds.
        duration_ms: u128,
        /// Fields written by the step's delta.
        fields_written: Vec<String>,
    },
    /// A step returned a classified failure.
    StepFailed {
        step: String,
        kind: ErrorKind,
        message: String,
    },
    /// A step fell back to a deterministic result.
    Degraded {
        step: String,
        reason: String,
    },
    /// The executor resolved the next node.
    Routed {
        from: String,
        /// `None` when the run reached the terminal sentinel.
        to: Option<String>,
    },
    /// The run deadline fired.
    DeadlineExceeded {
        /// The step that was running when the deadline fired, if any.
        step: Option<String>,
    },
}

/// A timestamped trace entry containing a run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Unix epoch timestamp in milliseconds when this event occurred.
    pub timestamp: u128,
    /// The recorded event.
    #[serde(flatten)]
    pub event: RunEvent,
}

impl TraceEntry {
    /// Create a new trace entry with the current timestamp.
    #[must_use]
    pub fn new(event: RunEvent) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self { timestamp, event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_entry_serialization() {
        let entry = TraceEntry::new(RunEvent::StepStarted {
            step: "score_matches".to_string(),
        });

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"StepStarted\""));
        assert!(json.contains("\"step\":\"score_matches\""));
        assert!(json.contains("\"timestamp\":"));
    }

    #[test]
    fn test_failure_event_carries_kind() {
        let event = RunEvent::StepFailed {
            step: "fetch_user_profile".to_string(),
            kind: ErrorKind::CollaboratorUnavailable,
            message: "store offline".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"collaborator_unavailable\""));
    }
}
