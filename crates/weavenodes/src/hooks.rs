use async_trait::async_trait;
use std::sync::Mutex;
use weavecore::{ExecutionId, SharedState, WorkError};
use weaveruntime::{HookContext, StepHook};

/// State after one step, as seen by the recorder
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub execution_id: ExecutionId,
    pub step: String,
    pub state: SharedState,
}

/// Keeps a copy of the shared state after every step, in memory.
#[derive(Default)]
pub struct SnapshotRecorder {
    keys: Option<Vec<String>>,
    snapshots: Mutex<Vec<Snapshot>>,
}

impl SnapshotRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only keep these keys in each snapshot
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: Some(keys.into_iter().map(Into::into).collect()),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots
            .lock()
            .map(|snapshots| snapshots.clone())
            .unwrap_or_default()
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.snapshots
            .lock()
            .ok()
            .and_then(|snapshots| snapshots.last().cloned())
    }

    fn capture(&self, state: &SharedState) -> SharedState {
        match &self.keys {
            Some(keys) => keys
                .iter()
                .filter_map(|key| state.get(key).map(|v| (key.clone(), v.clone())))
                .collect(),
            None => state.clone(),
        }
    }
}

#[async_trait]
impl StepHook for SnapshotRecorder {
    fn name(&self) -> &str {
        "snapshot-recorder"
    }

    async fn after_step(&self, ctx: &HookContext<'_>) -> Result<(), WorkError> {
        let snapshot = Snapshot {
            execution_id: ctx.execution_id,
            step: ctx.step.to_string(),
            state: self.capture(ctx.state),
        };
        self.snapshots
            .lock()
            .map_err(|_| WorkError::ExecutionFailed("snapshot store lock poisoned".into()))?
            .push(snapshot);
        Ok(())
    }
}
