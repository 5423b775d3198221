use crate::{
    hooks::StepHook, loader::WorkflowLoader, registry::StepRegistry, Executor, RunReport,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use weavecore::{
    BuildError, EventBus, ExecutionEvent, FlowError, SharedState, Workflow, WorkflowDefinition,
    WorkflowId,
};

/// Main runtime for executing workflows
pub struct WeaveRuntime {
    registry: Arc<StepRegistry>,
    executor: Executor,
    event_bus: Arc<EventBus>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Workflow>>>,
    config: RuntimeConfig,
}

impl WeaveRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(StepRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<StepRegistry>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let executor = Executor::new(event_bus.sender());

        Self {
            registry,
            executor,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Add a hook invoked after every step merge
    pub fn with_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.executor = self.executor.with_hook(hook);
        self
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Build a workflow from its definition using the registered step types
    pub fn load(&self, definition: &WorkflowDefinition) -> Result<Workflow, BuildError> {
        WorkflowLoader::new(&self.registry, self.config.default_max_iterations).load(definition)
    }

    /// Register a workflow for later execution by id
    pub async fn register_workflow(&self, workflow: Workflow) -> WorkflowId {
        let id = workflow.id;
        let mut workflows = self.workflows.write().await;
        workflows.insert(id, workflow);
        id
    }

    /// Execute a registered workflow by id
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
        initial: SharedState,
    ) -> Result<RunReport, FlowError> {
        let workflow = {
            let workflows = self.workflows.read().await;
            workflows
                .get(&workflow_id)
                .cloned()
                .ok_or_else(|| FlowError::Execution(format!("Workflow not found: {}", workflow_id)))?
        };

        self.executor.run(&workflow, initial).await
    }

    /// Execute a workflow directly (without registration)
    pub async fn execute(
        &self,
        workflow: &Workflow,
        initial: SharedState,
    ) -> Result<RunReport, FlowError> {
        self.executor.run(workflow, initial).await
    }

    /// Execute a workflow that stops at the next step boundary once
    /// `cancellation` fires. The token belongs to this run only.
    pub async fn execute_with_cancellation(
        &self,
        workflow: &Workflow,
        initial: SharedState,
        cancellation: CancellationToken,
    ) -> Result<RunReport, FlowError> {
        self.executor
            .run_with_cancellation(workflow, initial, cancellation)
            .await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for WeaveRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    /// Cap applied to loop definitions that do not declare one
    pub default_max_iterations: u32,
}

impl RuntimeConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            default_max_iterations: 10,
        }
    }
}
