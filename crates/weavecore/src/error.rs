use thiserror::Error;

/// Errors raised while running a workflow.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Step '{step}' is missing required input '{key}'")]
    MissingInput { step: String, key: String },

    #[error("Step '{step}' failed: {source}")]
    UnitOfWork {
        step: String,
        #[source]
        source: WorkError,
    },

    #[error("{} sibling(s) of parallel node '{node}' failed: {}", .failures.len(), summarize(.failures))]
    SiblingFailures {
        node: String,
        failures: Vec<FlowError>,
    },

    #[error("Hook '{hook}' failed after step '{step}': {message}")]
    Hook {
        hook: String,
        step: String,
        message: String,
    },

    #[error("Branch '{node}' cannot route on value of type {actual} under '{key}'")]
    InvalidRoute {
        node: String,
        key: String,
        actual: String,
    },

    #[error("Run cancelled before step '{step}'")]
    Cancelled { step: String },

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Name of the step (or composite node) the error is attributed to.
    pub fn step(&self) -> Option<&str> {
        match self {
            FlowError::MissingInput { step, .. }
            | FlowError::UnitOfWork { step, .. }
            | FlowError::Hook { step, .. }
            | FlowError::Cancelled { step } => Some(step),
            FlowError::SiblingFailures { node, .. } | FlowError::InvalidRoute { node, .. } => {
                Some(node)
            }
            _ => None,
        }
    }
}

fn summarize(failures: &[FlowError]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures reported by a unit of work. Opaque to the composers, which wrap
/// them in [`FlowError::UnitOfWork`] together with the step name.
#[derive(Error, Debug, Clone)]
pub enum WorkError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },
}

/// Configuration mistakes detected while constructing a composition tree.
/// None of these can occur once a [`crate::Workflow`] exists.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("Parallel node '{node}': steps '{first}' and '{second}' both write output key '{key}'")]
    OutputKeyCollision {
        node: String,
        key: String,
        first: String,
        second: String,
    },

    #[error("Parallel node '{node}': '{consumer}' requires '{key}', which sibling '{producer}' produces")]
    SiblingDependency {
        node: String,
        key: String,
        consumer: String,
        producer: String,
    },

    #[error("Loop '{node}' needs a positive iteration cap")]
    InvalidIterationCap { node: String },

    #[error("Composite node '{0}' has no children")]
    EmptyComposite(String),

    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),
}
