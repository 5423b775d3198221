use crate::model::{config_str, model_step_from_config};
use crate::ModelClient;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use weavecore::{StepContext, StepOutput, TerminationSignal, UnitOfWork, Value, WorkError};
use weaveruntime::{ConfigField, StepFactory, StepMetadata};

pub const DEFAULT_APPROVAL_PHRASE: &str = "APPROVED";

/// Side effect run when the gate ends its loop
pub type ExitAction = Arc<dyn Fn(&StepContext) + Send + Sync>;

/// Loop body step that either ends the loop or delegates to `inner`.
///
/// Decision order on every pass:
/// 1. loop marker already set: return the passthrough value untouched
/// 2. approval input equals the phrase: run the exit action, return the
///    passthrough value and a termination signal
/// 3. otherwise run `inner`
///
/// The marker and passthrough keys must also be declared as (optional)
/// inputs of the step, since the gate only sees declared inputs.
pub struct ApprovalGate {
    inner: Arc<dyn UnitOfWork>,
    approval_key: String,
    phrase: String,
    marker_key: Option<String>,
    passthrough_key: Option<String>,
    on_exit: Option<ExitAction>,
}

impl ApprovalGate {
    pub fn new(inner: Arc<dyn UnitOfWork>, approval_key: impl Into<String>) -> Self {
        Self {
            inner,
            approval_key: approval_key.into(),
            phrase: DEFAULT_APPROVAL_PHRASE.to_string(),
            marker_key: None,
            passthrough_key: None,
            on_exit: None,
        }
    }

    pub fn with_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.phrase = phrase.into();
        self
    }

    pub fn with_marker_key(mut self, key: impl Into<String>) -> Self {
        self.marker_key = Some(key.into());
        self
    }

    pub fn with_passthrough_key(mut self, key: impl Into<String>) -> Self {
        self.passthrough_key = Some(key.into());
        self
    }

    pub fn on_exit(mut self, action: impl Fn(&StepContext) + Send + Sync + 'static) -> Self {
        self.on_exit = Some(Arc::new(action));
        self
    }

    fn passthrough(&self, ctx: &StepContext) -> StepOutput {
        match self.passthrough_key.as_deref().and_then(|key| ctx.input(key)) {
            Some(value) => StepOutput::value(value.clone()),
            None => StepOutput::new(),
        }
    }

    fn approved(&self, ctx: &StepContext) -> Result<bool, WorkError> {
        let verdict = ctx.require_str(&self.approval_key)?;
        Ok(verdict.trim() == self.phrase)
    }
}

#[async_trait]
impl UnitOfWork for ApprovalGate {
    fn kind(&self) -> &str {
        "loop.approval_gate"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, WorkError> {
        if self.marker_key.as_deref().is_some_and(|key| ctx.flag(key)) {
            ctx.events.info("loop already terminated, keeping current value");
            return Ok(self.passthrough(&ctx));
        }

        if self.approved(&ctx)? {
            if let Some(action) = &self.on_exit {
                action(&ctx);
            }
            ctx.events.info(format!("'{}' approved, exiting loop", self.approval_key));
            return Ok(self
                .passthrough(&ctx)
                .with_signal(TerminationSignal::stop_with("approved; exiting refinement loop")));
        }

        self.inner.execute(ctx).await
    }
}

/// Builds a gate around a `model.generate` refiner.
pub struct ApprovalGateFactory {
    client: Arc<dyn ModelClient>,
}

impl ApprovalGateFactory {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

impl StepFactory for ApprovalGateFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn UnitOfWork>, WorkError> {
        let inner = model_step_from_config(&self.client, config)?;
        let mut gate = ApprovalGate::new(Arc::new(inner), config_str(config, "approval_key")?);

        if let Some(phrase) = config.get("phrase").and_then(Value::as_str) {
            gate = gate.with_phrase(phrase);
        }
        if let Some(key) = config.get("marker_key").and_then(Value::as_str) {
            gate = gate.with_marker_key(key);
        }
        if let Some(key) = config.get("passthrough_key").and_then(Value::as_str) {
            gate = gate.with_passthrough_key(key);
        }
        Ok(Arc::new(gate))
    }

    fn kind(&self) -> &str {
        "loop.approval_gate"
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "End the enclosing loop on approval, otherwise refine with a model"
                .to_string(),
            category: "loop".to_string(),
            config: vec![
                ConfigField::required("instruction", "Instruction for the refining model"),
                ConfigField::required("approval_key", "State key holding the verdict"),
                ConfigField::optional("phrase", "Approval phrase (default APPROVED)"),
                ConfigField::optional("marker_key", "Loop marker key; skip work once set"),
                ConfigField::optional("passthrough_key", "Key returned unchanged on exit"),
                ConfigField::optional("model", "Model name override"),
            ],
        }
    }
}
