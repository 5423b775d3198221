use serde::{Deserialize, Serialize};

/// Raised by a step inside a loop body to end the loop after the current pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminationSignal {
    pub terminate: bool,
    pub message: Option<String>,
}

impl TerminationSignal {
    pub fn stop() -> Self {
        Self {
            terminate: true,
            message: None,
        }
    }

    pub fn stop_with(message: impl Into<String>) -> Self {
        Self {
            terminate: true,
            message: Some(message.into()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.terminate
    }
}
