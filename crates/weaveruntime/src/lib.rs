//! Workflow execution runtime
//!
//! This crate provides the engine that walks composition trees (the
//! sequential, parallel, loop and branch composers), the registry of step
//! types, the loader for declarative definitions, and static dataflow
//! analysis.

mod dataflow;
mod executor;
mod hooks;
mod loader;
mod registry;
mod runtime;

pub use dataflow::{DataflowGraph, UnresolvedInput};
pub use executor::{Executor, LoopReport, RunReport};
pub use hooks::{HookContext, StepHook};
pub use loader::{read_definition, WorkflowLoader};
pub use registry::{ConfigField, StepFactory, StepMetadata, StepRegistry};
pub use runtime::{RuntimeConfig, WeaveRuntime};
