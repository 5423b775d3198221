//! Standard step library
//!
//! Model-backed steps, the loop approval gate, and small utility steps,
//! plus the model clients they run against.

mod approval;
mod debug;
mod gemini;
mod hooks;
mod model;
mod retry;
mod scripted;
mod transform;

pub use approval::{ApprovalGate, ApprovalGateFactory, ExitAction, DEFAULT_APPROVAL_PHRASE};
pub use debug::{DebugStep, DebugStepFactory};
pub use gemini::{GeminiClient, GeminiConfig, API_KEY_VAR};
pub use hooks::{Snapshot, SnapshotRecorder};
pub use model::{ModelClient, ModelRequest, ModelStep, ModelStepFactory};
pub use retry::RetryPolicy;
pub use scripted::ScriptedModel;
pub use transform::{JsonParseStep, JsonParseStepFactory, JsonStringifyStep, JsonStringifyStepFactory};

use std::sync::Arc;
use weaveruntime::StepRegistry;

/// Register all standard steps, with model steps bound to `model`
pub fn register_all(registry: &mut StepRegistry, model: Arc<dyn ModelClient>) {
    registry.register(Arc::new(ModelStepFactory::new(model.clone())));
    registry.register(Arc::new(ApprovalGateFactory::new(model)));
    registry.register(Arc::new(DebugStepFactory));
    registry.register(Arc::new(JsonParseStepFactory));
    registry.register(Arc::new(JsonStringifyStepFactory));
}
