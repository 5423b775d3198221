use crate::{events::EventEmitter, FlowError, SharedState, TerminationSignal, Value, WorkError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// The opaque action a step wraps: a model call, a tool, a persistence call.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Type identifier (e.g., "model.generate", "debug.log")
    fn kind(&self) -> &str;

    /// Run against the resolved view of the step's declared inputs.
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, WorkError>;
}

/// Context passed to a unit of work
#[derive(Clone)]
pub struct StepContext {
    /// Name of the step being executed
    pub step: String,

    /// Declared inputs resolved from shared state. Required inputs are
    /// always present; optional ones only when the state held them.
    pub inputs: HashMap<String, Value>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,
}

impl StepContext {
    pub fn new(step: impl Into<String>, inputs: HashMap<String, Value>, events: EventEmitter) -> Self {
        Self {
            step: step.into(),
            inputs,
            events,
        }
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, WorkError> {
        self.inputs
            .get(name)
            .ok_or_else(|| WorkError::MissingInput(name.to_string()))
    }

    /// Get a required input that must be a string
    pub fn require_str(&self, name: &str) -> Result<&str, WorkError> {
        let value = self.require_input(name)?;
        value.as_str().ok_or_else(|| WorkError::InvalidInputType {
            field: name.to_string(),
            expected: "string".to_string(),
            actual: value.type_name().to_string(),
        })
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// True when an optional flag input is present and truthy
    pub fn flag(&self, name: &str) -> bool {
        self.inputs.get(name).is_some_and(Value::is_truthy)
    }
}

/// Result of a unit of work
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Value merged under the step's output key, if it has one
    pub value: Option<Value>,

    /// Set by steps inside a loop body to end the loop
    pub signal: Option<TerminationSignal>,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: TerminationSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn terminates(&self) -> bool {
        self.signal.as_ref().is_some_and(TerminationSignal::is_set)
    }
}

/// Unit of work backed by an async closure
pub struct FnWork<F> {
    kind: String,
    func: F,
}

impl<F> FnWork<F> {
    pub fn new(kind: impl Into<String>, func: F) -> Self {
        Self {
            kind: kind.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> UnitOfWork for FnWork<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutput, WorkError>> + Send + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, WorkError> {
        (self.func)(ctx).await
    }
}

/// A named unit of work with its declared data dependencies.
#[derive(Clone)]
pub struct Step {
    name: String,
    output_key: Option<String>,
    inputs: Vec<String>,
    optional_inputs: Vec<String>,
    work: Arc<dyn UnitOfWork>,
}

impl Step {
    pub fn new(name: impl Into<String>, work: Arc<dyn UnitOfWork>) -> Self {
        Self {
            name: name.into(),
            output_key: None,
            inputs: Vec::new(),
            optional_inputs: Vec::new(),
            work,
        }
    }

    /// Step whose unit of work is an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutput, WorkError>> + Send + 'static,
    {
        Self::new(name, Arc::new(FnWork::new("fn", func)))
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.output_key = if key.is_empty() { None } else { Some(key) };
        self
    }

    pub fn with_input(mut self, key: impl Into<String>) -> Self {
        self.inputs.push(key.into());
        self
    }

    pub fn with_inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_optional_input(mut self, key: impl Into<String>) -> Self {
        self.optional_inputs.push(key.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        self.work.kind()
    }

    pub fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn optional_inputs(&self) -> &[String] {
        &self.optional_inputs
    }

    pub fn work(&self) -> &Arc<dyn UnitOfWork> {
        &self.work
    }

    /// Resolve the declared inputs against `state`. Fails on the first
    /// required key that is absent.
    pub fn resolve_inputs(&self, state: &SharedState) -> Result<HashMap<String, Value>, FlowError> {
        let mut resolved = HashMap::with_capacity(self.inputs.len() + self.optional_inputs.len());
        for key in &self.inputs {
            resolved.insert(key.clone(), state.require(&self.name, key)?.clone());
        }
        for key in &self.optional_inputs {
            if let Some(value) = state.get(key) {
                resolved.insert(key.clone(), value.clone());
            }
        }
        Ok(resolved)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("kind", &self.work.kind())
            .field("output_key", &self.output_key)
            .field("inputs", &self.inputs)
            .field("optional_inputs", &self.optional_inputs)
            .finish()
    }
}
