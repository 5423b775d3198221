use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// How a loop execution ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LoopOutcome {
    TerminatedBySignal { message: Option<String> },
    TerminatedByCap,
}

impl LoopOutcome {
    pub fn by_signal(&self) -> bool {
        matches!(self, LoopOutcome::TerminatedBySignal { .. })
    }
}

/// Events emitted during a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    RunStarted {
        execution_id: ExecutionId,
        workflow: String,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        execution_id: ExecutionId,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        execution_id: ExecutionId,
        step: String,
        kind: String,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        execution_id: ExecutionId,
        step: String,
        output_key: Option<String>,
        output: Option<Value>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        execution_id: ExecutionId,
        step: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    LoopIteration {
        execution_id: ExecutionId,
        node: String,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },
    LoopFinished {
        execution_id: ExecutionId,
        node: String,
        iterations: u32,
        outcome: LoopOutcome,
        timestamp: DateTime<Utc>,
    },
    BranchSelected {
        execution_id: ExecutionId,
        node: String,
        route: Option<String>,
        timestamp: DateTime<Utc>,
    },
    StepEvent {
        execution_id: ExecutionId,
        step: String,
        event: StepEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Events a unit of work reports about itself while running
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum StepEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Event emitter handed to a unit of work through its context
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    step: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        step: impl Into<String>,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            step: step.into(),
            sender,
        }
    }

    /// Emitter with no subscribers, for running a unit of work standalone.
    pub fn detached(step: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self::new(Uuid::nil(), step, sender)
    }

    pub fn emit(&self, event: StepEvent) {
        let _ = self.sender.send(ExecutionEvent::StepEvent {
            execution_id: self.execution_id,
            step: self.step.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(StepEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(StepEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(StepEvent::Progress { percent, message });
    }
}

/// Broadcast bus for execution events
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn sender(&self) -> broadcast::Sender<ExecutionEvent> {
        self.sender.clone()
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, step: impl Into<String>) -> EventEmitter {
        EventEmitter::new(execution_id, step, self.sender.clone())
    }
}
