//! Per-run execution statistics.

use serde::{Deserialize, Serialize};

/// Aggregated metrics for one pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Number of steps whose delta was merged.
    pub steps_completed: usize,
    /// Number of LLM gateway invocations, successful or not.
    pub llm_calls: usize,
    /// Number of steps that fell back to a deterministic result.
    pub degraded_steps: usize,
    /// Collected failure messages.
    pub failures: Vec<String>,
    /// Wall-clock time of the run in milliseconds.
    pub elapsed_ms: u128,
}

impl RunMetrics {
    /// Increment the steps completed counter.
    pub fn record_step(&mut self) {
        self.steps_completed += 1;
    }

    pub fn record_llm_call(&mut self) {
        self.llm_calls += 1;
    }

    pub fn record_degraded(&mut self) {
        self.degraded_steps += 1;
    }

    /// Record a failure message.
    pub fn record_failure(&mut self, error: String) {
        self.failures.push(error);
    }

    /// Check if there were any failures.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}
