use async_trait::async_trait;
use weavecore::{ExecutionId, SharedState, WorkError};

/// What a hook sees after a step's output has been merged.
pub struct HookContext<'a> {
    pub execution_id: ExecutionId,
    pub step: &'a str,
    pub output_key: Option<&'a str>,
    pub state: &'a SharedState,
}

/// Optional extension point invoked after each step's merge.
///
/// For parallel siblings the hooks run once the barrier merge is done, in
/// declaration order, so they always observe merged state.
#[async_trait]
pub trait StepHook: Send + Sync {
    fn name(&self) -> &str;

    async fn after_step(&self, ctx: &HookContext<'_>) -> Result<(), WorkError>;
}
