//! # campus-agents
//!
//! Bounded-time pipeline graphs for campus agents, with deterministic
//! compatibility scoring and optional LLM enrichment.
//!
//! A pipeline is a [`graph::CompiledGraph`] of named [`Step`]s. The
//! [`Executor`] walks it under a hard deadline, merging each step's
//! [`StateDelta`] into an immutable [`State`]. Steps that lose a
//! collaborator fall back to a deterministic answer and mark the state
//! degraded instead of failing the run.
//!
//! ## Core Concepts
//!
//! - **State / StateDelta**: Keyed pipeline state and the changes a step returns
//! - **Step**: The unit of work inside a graph
//! - **GraphDefinition**: Builder for nodes, edges and conditional routing
//! - **Executor**: Runs a compiled graph within a time budget
//! - **ScoringEngine**: Deterministic candidate filtering, scoring and ranking
//! - **PipelineRegistry**: The matching, safety, onboarding and recommendations
//!   pipelines, served by name
//!
//! ## Example: A Two-Step Graph
//!
//! ```rust
//! use std::time::Duration;
//! use campus_agents::graph::{EdgeCondition, GraphDefinition, Target};
//! use campus_agents::{Executor, LambdaStep, State, StateDelta};
//!
//! # tokio_test::block_on(async {
//! let graph = GraphDefinition::new("greeting")
//!     .add_node("classify", LambdaStep::new(|s: State| async move {
//!         let formal = s.get_str("name").is_some_and(|n| n.starts_with("Dr"));
//!         Ok(StateDelta::new().set("formal", formal))
//!     }))
//!     .add_node("formal", LambdaStep::new(|_: State| async { Ok(StateDelta::new().set("greeting", "Good day")) }))
//!     .add_node("casual", LambdaStep::new(|_: State| async { Ok(StateDelta::new().set("greeting", "Hey")) }))
//!     .set_entry("classify")
//!     .add_conditional_edges(
//!         "classify",
//!         vec![(EdgeCondition::truthy("formal"), Target::node("formal"))],
//!         "casual",
//!     )
//!     .set_finish("formal")
//!     .set_finish("casual")
//!     .compile()
//!     .unwrap();
//!
//! let initial = State::new().merge(StateDelta::new().set("name", "Dr Who"));
//! let outcome = Executor::new().run(&graph, initial, Duration::from_secs(1)).await;
//!
//! assert!(outcome.is_completed());
//! assert_eq!(outcome.state().get_str("greeting"), Some("Good day"));
//! # });
//! ```

pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod metrics;
pub mod pipelines;
pub mod provider;
pub mod schema;
pub mod scoring;
pub mod state;
pub mod step;
pub mod telemetry;

pub use context::ExecutionContext;
pub use error::{Error, ErrorKind, Result, StepError};
pub use events::{RunEvent, TraceEntry};
pub use executor::{Executor, RunOutcome, RunReport};
pub use metrics::RunMetrics;
pub use pipelines::{Collaborators, PipelineKind, PipelineRegistry, PipelineResponse};
pub use state::{State, StateDelta};
pub use step::{LambdaStep, PassStep, Step, StepResult};
