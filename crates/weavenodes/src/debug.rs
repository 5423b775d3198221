use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use weavecore::{StepContext, StepOutput, UnitOfWork, Value, WorkError};
use weaveruntime::{ConfigField, StepFactory, StepMetadata};

/// Logs its inputs. Produces no value.
pub struct DebugStep {
    message: Option<String>,
}

impl DebugStep {
    pub fn new(message: Option<String>) -> Self {
        Self { message }
    }
}

#[async_trait]
impl UnitOfWork for DebugStep {
    fn kind(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, WorkError> {
        let message = self.message.as_deref().unwrap_or("(no message)");
        ctx.events.info(format!("DEBUG: {}", message));
        tracing::info!("[{}] {}", ctx.step, message);

        let mut keys: Vec<&String> = ctx.inputs.keys().collect();
        keys.sort();
        for key in keys {
            ctx.events.info(format!("  {}: {}", key, ctx.inputs[key]));
        }

        Ok(StepOutput::new())
    }
}

pub struct DebugStepFactory;

impl StepFactory for DebugStepFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn UnitOfWork>, WorkError> {
        let message = config.get("message").and_then(Value::as_str).map(str::to_string);
        Ok(Arc::new(DebugStep::new(message)))
    }

    fn kind(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Logs input values for debugging".to_string(),
            category: "debug".to_string(),
            config: vec![ConfigField::optional("message", "Line logged before the inputs")],
        }
    }
}
