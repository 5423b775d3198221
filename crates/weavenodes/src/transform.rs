use crate::model::config_str;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use weavecore::{StepContext, StepOutput, UnitOfWork, Value, WorkError};
use weaveruntime::{ConfigField, StepFactory, StepMetadata};

/// Parse the text under `source` into a structured value
pub struct JsonParseStep {
    source: String,
}

impl JsonParseStep {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// Model output often wraps JSON in a fenced code block.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.trim_start_matches("json");
    body.strip_suffix("```").unwrap_or(body).trim()
}

#[async_trait]
impl UnitOfWork for JsonParseStep {
    fn kind(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, WorkError> {
        let input = ctx.require_str(&self.source)?;

        let parsed: serde_json::Value = serde_json::from_str(strip_fence(input))
            .map_err(|e| WorkError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(StepOutput::value(parsed))
    }
}

pub struct JsonParseStepFactory;

impl StepFactory for JsonParseStepFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn UnitOfWork>, WorkError> {
        Ok(Arc::new(JsonParseStep::new(config_str(config, "source")?)))
    }

    fn kind(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
            config: vec![ConfigField::required("source", "Input key holding the JSON text")],
        }
    }
}

/// Render the value under `source` as pretty JSON text
pub struct JsonStringifyStep {
    source: String,
}

impl JsonStringifyStep {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl UnitOfWork for JsonStringifyStep {
    fn kind(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, WorkError> {
        let value = ctx.require_input(&self.source)?;

        let json_str = serde_json::to_string_pretty(value)
            .map_err(|e| WorkError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(StepOutput::value(json_str))
    }
}

pub struct JsonStringifyStepFactory;

impl StepFactory for JsonStringifyStepFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn UnitOfWork>, WorkError> {
        Ok(Arc::new(JsonStringifyStep::new(config_str(config, "source")?)))
    }

    fn kind(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Convert value to JSON string".to_string(),
            category: "transform".to_string(),
            config: vec![ConfigField::required("source", "Input key holding the value")],
        }
    }
}
