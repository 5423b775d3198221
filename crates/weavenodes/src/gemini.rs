use crate::{ModelClient, ModelRequest, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use weavecore::WorkError;

pub const API_KEY_VAR: &str = "GOOGLE_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.5-flash-lite".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout_secs: 120,
            retry: RetryPolicy::default(),
        }
    }
}

impl GeminiConfig {
    /// Defaults with the key taken from `GOOGLE_API_KEY`.
    pub fn from_env() -> Result<Self, WorkError> {
        let api_key = std::env::var(API_KEY_VAR)
            .map_err(|_| WorkError::Configuration(format!("{} is not set", API_KEY_VAR)))?;
        Ok(Self {
            api_key,
            ..Self::default()
        })
    }
}

/// Client for the hosted `generateContent` endpoint.
pub struct GeminiClient {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, WorkError> {
        if config.api_key.is_empty() {
            return Err(WorkError::Configuration("Gemini API key is empty".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| WorkError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, request: &ModelRequest) -> String {
        let model = request.model.as_deref().unwrap_or(&self.config.model);
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        )
    }

    async fn send_once(&self, url: &str, body: &serde_json::Value) -> Result<String, Attempt> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Attempt::Fatal(WorkError::Timeout {
                        seconds: self.config.timeout_secs,
                    })
                } else {
                    Attempt::Fatal(WorkError::ExecutionFailed(format!("request failed: {}", e)))
                }
            })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| Attempt::Fatal(WorkError::ExecutionFailed(format!("read failed: {}", e))))?;

        if !(200..300).contains(&status) {
            return Err(Attempt::Status(status, text));
        }
        parse_response(&text).map_err(Attempt::Fatal)
    }
}

enum Attempt {
    Status(u16, String),
    Fatal(WorkError),
}

#[async_trait]
impl ModelClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: &ModelRequest) -> Result<String, WorkError> {
        let url = self.endpoint(request);
        let body = request_body(request);
        let policy = &self.config.retry;

        let mut attempt = 1;
        loop {
            match self.send_once(&url, &body).await {
                Ok(text) => return Ok(text),
                Err(Attempt::Status(status, message)) if policy.should_retry(status, attempt) => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        "Gemini returned {} (attempt {}/{}), retrying in {:?}",
                        status,
                        attempt,
                        policy.attempts,
                        delay
                    );
                    tracing::debug!("Gemini error body: {}", message);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(Attempt::Status(status, message)) => {
                    return Err(WorkError::Http { status, message })
                }
                Err(Attempt::Fatal(e)) => return Err(e),
            }
        }
    }
}

pub(crate) fn request_body(request: &ModelRequest) -> serde_json::Value {
    json!({
        "systemInstruction": { "parts": [{ "text": request.instruction }] },
        "contents": [{ "role": "user", "parts": [{ "text": request.prompt() }] }],
    })
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

pub(crate) fn parse_response(body: &str) -> Result<String, WorkError> {
    let response: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| WorkError::ExecutionFailed(format!("invalid Gemini response: {}", e)))?;

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| WorkError::ExecutionFailed("Gemini returned no candidates".into()))?;

    let text: String = candidate
        .content
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".into());
        return Err(WorkError::ExecutionFailed(format!(
            "Gemini returned no text (finish reason: {})",
            reason
        )));
    }
    Ok(text)
}
