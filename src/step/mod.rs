//! Core step trait and closure-based steps.
//!
//! A [`Step`] reads the current [`State`] and returns a [`StateDelta`] of
//! fields to merge, or a classified [`StepError`]. Steps never mutate state
//! directly; the executor owns merging.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

use crate::error::StepError;
use crate::state::{State, StateDelta};
use crate::ExecutionContext;

/// What a step hands back to the executor.
pub type StepResult = std::result::Result<StateDelta, StepError>;

/// A single named computation node within a pipeline graph.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use campus_agents::{ExecutionContext, State, StateDelta, Step, StepResult};
///
/// struct Greet;
///
/// #[async_trait]
/// impl Step for Greet {
///     async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
///         let name = state.get_str("name").unwrap_or("stranger");
///         Ok(StateDelta::new().set("greeting", format!("hello {name}")))
///     }
///
///     fn name(&self) -> &str {
///         "greet"
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync {
    /// Execute this step against the current state.
    async fn run(&self, ctx: &ExecutionContext, state: &State) -> StepResult;

    /// Returns a human-readable name for this step. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A step constructed from a closure over a state snapshot.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use campus_agents::{ExecutionContext, LambdaStep, State, StateDelta, Step};
///
/// # tokio_test::block_on(async {
/// let step = LambdaStep::new(|state: State| async move {
///     let n = state.get_i64("n").unwrap_or(0);
///     Ok(StateDelta::new().set("n", n + 1))
/// });
///
/// let ctx = ExecutionContext::new(Duration::from_secs(1));
/// let delta = step.run(&ctx, &State::new()).await.unwrap();
/// assert_eq!(State::new().merge(delta).get_i64("n"), Some(1));
/// # });
/// ```
pub struct LambdaStep<F> {
    /// The underlying closure.
    pub f: F,
    _phantom: PhantomData<fn(State)>,
}

impl<F, Fut> LambdaStep<F>
where
    F: Fn(State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    /// Create a new `LambdaStep` from the given closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Step for LambdaStep<F>
where
    F: Fn(State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    async fn run(&self, _ctx: &ExecutionContext, state: &State) -> StepResult {
        (self.f)(state.clone()).await
    }
}

/// A step that leaves the state untouched. Handy as a join point.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassStep;

#[async_trait]
impl Step for PassStep {
    async fn run(&self, _ctx: &ExecutionContext, _state: &State) -> StepResult {
        Ok(StateDelta::new())
    }

    fn name(&self) -> &str {
        "pass"
    }
}
