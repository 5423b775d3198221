use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use weavecore::{StepContext, StepOutput, UnitOfWork, Value, WorkError, QUERY_KEY};
use weaveruntime::{ConfigField, StepFactory, StepMetadata};

/// A text generation backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Backend identifier used in logs
    fn name(&self) -> &str;

    async fn generate(&self, request: &ModelRequest) -> Result<String, WorkError>;
}

/// One generation call: the step's instruction, its resolved inputs and
/// the user query when the step declared it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: Option<String>,
    pub instruction: String,
    /// Declared inputs other than the query, sorted by key
    pub context: Vec<(String, String)>,
    pub query: Option<String>,
}

impl ModelRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            model: None,
            instruction: instruction.into(),
            context: Vec::new(),
            query: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, text: impl Into<String>) -> Self {
        self.context.push((key.into(), text.into()));
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Build a request from a step's resolved inputs.
    pub fn from_inputs(instruction: &str, inputs: &HashMap<String, Value>) -> Self {
        let mut request = Self::new(instruction);
        let mut keys: Vec<&String> = inputs.keys().collect();
        keys.sort();
        for key in keys {
            let text = render_value(&inputs[key]);
            if key == QUERY_KEY {
                request.query = Some(text);
            } else {
                request.context.push((key.clone(), text));
            }
        }
        request
    }

    /// Body of the user turn: a tagged block per context entry followed by
    /// the query. Inputs are never spliced into the instruction text.
    pub fn prompt(&self) -> String {
        let mut prompt = String::new();
        for (key, text) in &self.context {
            let _ = write!(prompt, "<{key}>\n{text}\n</{key}>\n\n");
        }
        match &self.query {
            Some(query) => prompt.push_str(query),
            None if prompt.is_empty() => prompt.push_str("Proceed."),
            None => {}
        }
        prompt.trim_end().to_string()
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Step whose work is a single model call.
pub struct ModelStep {
    client: Arc<dyn ModelClient>,
    instruction: String,
    model: Option<String>,
}

impl ModelStep {
    pub fn new(client: Arc<dyn ModelClient>, instruction: impl Into<String>) -> Self {
        Self {
            client,
            instruction: instruction.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub(crate) async fn generate(&self, ctx: &StepContext) -> Result<String, WorkError> {
        let mut request = ModelRequest::from_inputs(&self.instruction, &ctx.inputs);
        request.model = self.model.clone();

        ctx.events
            .info(format!("calling {} with {} context block(s)", self.client.name(), request.context.len()));
        let text = self.client.generate(&request).await?;
        tracing::debug!("{} returned {} bytes", ctx.step, text.len());
        Ok(text)
    }
}

#[async_trait]
impl UnitOfWork for ModelStep {
    fn kind(&self) -> &str {
        "model.generate"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, WorkError> {
        let text = self.generate(&ctx).await?;
        Ok(StepOutput::value(text))
    }
}

pub struct ModelStepFactory {
    client: Arc<dyn ModelClient>,
}

impl ModelStepFactory {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

/// Read a required string entry from step config.
pub(crate) fn config_str<'a>(
    config: &'a HashMap<String, Value>,
    field: &str,
) -> Result<&'a str, WorkError> {
    let value = config
        .get(field)
        .ok_or_else(|| WorkError::Configuration(format!("missing '{}'", field)))?;
    value.as_str().ok_or_else(|| WorkError::InvalidInputType {
        field: field.to_string(),
        expected: "string".to_string(),
        actual: value.type_name().to_string(),
    })
}

pub(crate) fn model_step_from_config(
    client: &Arc<dyn ModelClient>,
    config: &HashMap<String, Value>,
) -> Result<ModelStep, WorkError> {
    let mut step = ModelStep::new(client.clone(), config_str(config, "instruction")?);
    if let Some(model) = config.get("model").and_then(Value::as_str) {
        step = step.with_model(model);
    }
    Ok(step)
}

impl StepFactory for ModelStepFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn UnitOfWork>, WorkError> {
        Ok(Arc::new(model_step_from_config(&self.client, config)?))
    }

    fn kind(&self) -> &str {
        "model.generate"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Generate text from an instruction and the step's inputs".to_string(),
            category: "model".to_string(),
            config: vec![
                ConfigField::required("instruction", "System instruction for the model"),
                ConfigField::optional("model", "Model name override"),
            ],
        }
    }
}
