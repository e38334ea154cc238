//! Execution context for pipeline runs.
//!
//! One `ExecutionContext` exists per run. It carries the run's wall-clock
//! deadline and cancellation token, and collects metrics and the structured
//! trace. Steps use it to derive step-local timeouts from whatever budget the
//! run has left.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::{RunEvent, TraceEntry};
use crate::metrics::RunMetrics;

/// Longest run budget honoured; about thirty years, as tokio uses for its
/// own far-future timers.
pub const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Context passed to every step in a run.
///
/// Cloning is cheap and clones share metrics, trace and cancellation.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use campus_agents::{ExecutionContext, RunEvent};
///
/// # tokio_test::block_on(async {
/// let ctx = ExecutionContext::new(Duration::from_secs(30));
/// ctx.emit(RunEvent::StepStarted { step: "fetch_user_profile".to_string() });
///
/// assert!(ctx.step_budget(Duration::from_secs(5)) <= Duration::from_secs(5));
/// assert_eq!(ctx.trace_snapshot().len(), 1);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    run_id: String,
    deadline: Instant,
    cancel: CancellationToken,
    metrics: Arc<Mutex<RunMetrics>>,
    traces: Arc<Mutex<Vec<TraceEntry>>>,
}

impl ExecutionContext {
    /// Create a context whose deadline is `budget` from now. Budgets past
    /// the clock's range are clamped to [`FAR_FUTURE`].
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self::with_deadline(Instant::now() + budget.min(FAR_FUTURE))
    }

    /// Create a context with an absolute deadline.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            deadline,
            cancel: CancellationToken::new(),
            metrics: Arc::new(Mutex::new(RunMetrics::default())),
            traces: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Identifier of this run, used to correlate log lines.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the run deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the run budget is used up.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Step-local timeout: the smaller of `cap` and the remaining run budget.
    pub fn step_budget(&self, cap: Duration) -> Duration {
        self.remaining().min(cap)
    }

    /// Token fired when the run is cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run has been cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    fn metrics(&self) -> MutexGuard<'_, RunMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn traces(&self) -> MutexGuard<'_, Vec<TraceEntry>> {
        self.traces.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Increment the steps completed counter.
    pub fn record_step(&self) {
        self.metrics().record_step();
    }

    /// Count an LLM gateway invocation.
    pub fn record_llm_call(&self) {
        self.metrics().record_llm_call();
    }

    /// Record that `step` fell back to a deterministic result.
    pub fn record_degraded(&self, step: &str, reason: impl Into<String>) {
        self.metrics().record_degraded();
        self.emit(RunEvent::Degraded {
            step: step.to_string(),
            reason: reason.into(),
        });
    }

    /// Record a failure message.
    pub fn record_failure(&self, error: impl Into<String>) {
        self.metrics().record_failure(error.into());
    }

    pub(crate) fn record_elapsed(&self, elapsed: Duration) {
        self.metrics().elapsed_ms = elapsed.as_millis();
    }

    /// Get a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> RunMetrics {
        self.metrics().clone()
    }

    /// Emit a structured event to the trace log.
    pub fn emit(&self, event: RunEvent) {
        let entry = TraceEntry::new(event);
        self.traces().push(entry);
    }

    /// Get a snapshot of the current trace log.
    #[must_use]
    pub fn trace_snapshot(&self) -> Vec<TraceEntry> {
        self.traces().clone()
    }
}
