use crate::{ModelClient, ModelRequest};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use weavecore::WorkError;

/// Offline model: replies with queued responses in order, then echoes.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: impl Into<String>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(response.into());
        }
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

fn echo(request: &ModelRequest) -> String {
    let task = request.instruction.lines().next().unwrap_or_default().trim();
    match (&request.query, request.context.last()) {
        (Some(query), _) => format!("[{}] {}", task, query),
        (None, Some((key, _))) => format!("[{}] based on {}", task, key),
        (None, None) => format!("[{}]", task),
    }
}

fn poisoned<T>(_: T) -> WorkError {
    WorkError::ExecutionFailed("scripted model lock poisoned".into())
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &ModelRequest) -> Result<String, WorkError> {
        self.requests.lock().map_err(poisoned)?.push(request.clone());
        let queued = self.responses.lock().map_err(poisoned)?.pop_front();
        Ok(queued.unwrap_or_else(|| echo(request)))
    }
}
