//! Core abstractions for the weave orchestrator
//!
//! This crate provides the data model every other crate depends on: shared
//! state, steps and their units of work, the composition tree, declarative
//! workflow definitions, execution events and the error taxonomy. It does
//! not execute anything.

mod composition;
mod definition;
mod error;
pub mod events;
mod signal;
mod state;
mod step;
mod value;

pub use composition::{
    BranchNode, Composition, LoopNode, ParallelNode, SequentialNode, Workflow, WorkflowId,
};
pub use definition::{NodeDefinition, StepDefinition, WorkflowDefinition};
pub use error::{BuildError, FlowError, WorkError};
pub use events::*;
pub use signal::TerminationSignal;
pub use state::{SharedState, QUERY_KEY};
pub use step::{FnWork, Step, StepContext, StepOutput, UnitOfWork};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
