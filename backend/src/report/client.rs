use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::{GenerationProtocol, ReportConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
}

impl From<&ReportConfig> for GenerationParams {
    fn from(config: &ReportConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            repetition_penalty: config.repetition_penalty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("No API credential configured")]
    Unconfigured,
    #[error("Credential rejected (HTTP {0})")]
    Unauthorized(u16),
    #[error("Model is warming up")]
    WarmingUp,
    #[error("Rate limited")]
    RateLimited,
    #[error("Server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },
    #[error("Request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Request timed out")]
    Timeout,
    #[error("Service unreachable: {0}")]
    Unreachable(String),
    #[error("Service returned no text")]
    EmptyResponse,
    #[error("Undecodable response: {0}")]
    Decode(String),
}

impl GenerationError {
    /// Permanent errors are not worth another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            GenerationError::Unconfigured
                | GenerationError::Unauthorized(_)
                | GenerationError::Rejected { .. }
        )
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => GenerationError::Unauthorized(status),
            429 => GenerationError::RateLimited,
            503 => GenerationError::WarmingUp,
            500..=599 => GenerationError::Server { status, body },
            _ => GenerationError::Rejected { status, body },
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GenerationError::Timeout
        } else if e.is_decode() {
            GenerationError::Decode(e.to_string())
        } else {
            GenerationError::Unreachable(e.to_string())
        }
    }
}

/// Remote text model. Swapped for a double in tests.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_id(&self) -> &str;

    fn is_configured(&self) -> bool {
        true
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams)
    -> Result<String, GenerationError>;
}

pub struct HuggingFaceClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    protocol: GenerationProtocol,
    token: Option<String>,
}

impl HuggingFaceClient {
    pub fn new(config: &ReportConfig) -> Result<Self, GenerationError> {
        let http = reqwest::Client::builder()
            .timeout(config.attempt_timeout())
            .build()
            .map_err(|e| GenerationError::Unreachable(format!("HTTP client setup: {}", e)))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            protocol: config.protocol,
            token: config.token.clone(),
        })
    }

    fn request_body(&self, prompt: &str, params: &GenerationParams) -> Value {
        match self.protocol {
            GenerationProtocol::TextGeneration => json!({
                "inputs": prompt,
                "parameters": {
                    "max_new_tokens": params.max_new_tokens,
                    "temperature": params.temperature,
                    "do_sample": true,
                    "top_p": params.top_p,
                    "repetition_penalty": params.repetition_penalty,
                    "return_full_text": false,
                }
            }),
            GenerationProtocol::ChatCompletions => json!({
                "model": self.model,
                "messages": [{ "role": "user", "content": prompt }],
                "max_tokens": params.max_new_tokens,
                "temperature": params.temperature,
                "top_p": params.top_p,
            }),
        }
    }
}

#[async_trait]
impl TextGenerator for HuggingFaceClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, GenerationError> {
        let token = self.token.as_deref().ok_or(GenerationError::Unconfigured)?;

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(&self.request_body(prompt, params))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::from_status(status.as_u16(), body));
        }

        let payload: Value = response.json().await?;
        extract_text(self.protocol, &payload)
    }
}

pub(crate) fn extract_text(protocol: GenerationProtocol, payload: &Value) -> Result<String, GenerationError> {
    let text = match protocol {
        GenerationProtocol::TextGeneration => {
            let entry = payload.get(0).unwrap_or(payload);
            entry.get("generated_text").and_then(Value::as_str)
        }
        GenerationProtocol::ChatCompletions => payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str),
    }
    .ok_or_else(|| GenerationError::Decode(format!("unexpected response shape: {}", payload)))?;

    let text = text.trim();
    if text.is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(text.to_string())
}
