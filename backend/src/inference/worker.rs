use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;

use super::{EngineInfo, InferenceEngine, InferenceError, RawPrediction};
use crate::config::EngineConfig;
use crate::imaging::NormalizedImage;

#[derive(Serialize)]
struct WorkerRequest {
    width: u32,
    height: u32,
    /// Base64 of row-major little-endian f32.
    pixels: String,
}

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    prediction: Option<RawPrediction>,
    #[serde(default)]
    model_info: Option<serde_json::Value>,
}

/// Runs the classifier as a child process per call, so a crashing model
/// runtime only takes its own process down.
pub struct SubprocessEngine {
    command: String,
    args: Vec<String>,
    model_path: Option<String>,
    timeout: Duration,
    init_timeout: Duration,
    slots: Arc<Semaphore>,
}

impl SubprocessEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            model_path: config.model_path.clone(),
            timeout: config.timeout(),
            init_timeout: config.init_timeout(),
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
        }
    }

    async fn call(
        &self,
        action: &str,
        payload: Vec<u8>,
        limit: Duration,
    ) -> Result<WorkerResponse, InferenceError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args).arg("--action").arg(action);
        if let Some(path) = &self.model_path {
            cmd.arg("--model-path").arg(path);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Waiting for a free slot counts against the same limit as the run.
        let exchange = async move {
            let _permit = self
                .slots
                .acquire()
                .await
                .map_err(|_| InferenceError::EngineUnavailable("worker pool closed".into()))?;

            let mut child = cmd.spawn().map_err(|e| {
                InferenceError::EngineUnavailable(format!("failed to spawn {}: {}", self.command, e))
            })?;
            let stdin = child.stdin.take();
            let write = async move {
                if let Some(mut stdin) = stdin {
                    match stdin.write_all(&payload).await {
                        Ok(()) => stdin.shutdown().await.ok(),
                        // The worker may legitimately exit without reading.
                        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => None,
                        Err(e) => {
                            log::warn!("Failed to write worker request: {}", e);
                            None
                        }
                    };
                }
            };
            let ((), output) = tokio::join!(write, child.wait_with_output());
            output.map_err(|e| InferenceError::EngineUnavailable(format!("worker I/O failed: {}", e)))
        };

        // Dropping the exchange on timeout drops the child, which kills it.
        let output = tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| InferenceError::InferenceTimeout(limit))??;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            log::debug!("Worker stderr ({}): {}", action, stderr.trim());
        }

        match parse_response(&output.stdout) {
            Some(response) => Ok(response),
            None if !output.status.success() => Err(InferenceError::MalformedEngineOutput(format!(
                "worker exited with {} and no response: {}",
                output.status,
                stderr.lines().last().unwrap_or("")
            ))),
            None => Err(InferenceError::MalformedEngineOutput(
                "worker stdout is not a JSON response".into(),
            )),
        }
    }
}

/// Whole stdout first, then the last non-empty line for workers that also
/// print progress to stdout.
fn parse_response(stdout: &[u8]) -> Option<WorkerResponse> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    serde_json::from_str(text).ok().or_else(|| {
        text.lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str(line.trim()).ok())
    })
}

#[async_trait]
impl InferenceEngine for SubprocessEngine {
    fn name(&self) -> String {
        format!("subprocess:{}", self.command)
    }

    async fn initialize(&self) -> Result<EngineInfo, InferenceError> {
        let response = self.call("init", Vec::new(), self.init_timeout).await?;
        if !response.success {
            return Err(InferenceError::EngineUnavailable(
                response.error.unwrap_or_else(|| "worker reported failure".into()),
            ));
        }

        let details = response.model_info;
        let field = |key: &str| {
            details
                .as_ref()
                .and_then(|info| info.get(key))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        Ok(EngineInfo {
            name: field("name").unwrap_or_else(|| self.name()),
            version: field("version"),
            details: details.clone(),
        })
    }

    async fn predict(&self, image: &NormalizedImage) -> Result<RawPrediction, InferenceError> {
        let request = WorkerRequest {
            width: image.width(),
            height: image.height(),
            pixels: STANDARD.encode(image.to_le_bytes()),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| InferenceError::MalformedEngineOutput(format!("request encode: {}", e)))?;

        let response = self.call("predict", payload, self.timeout).await?;
        if !response.success {
            return Err(InferenceError::EngineUnavailable(
                response.error.unwrap_or_else(|| "worker reported failure".into()),
            ));
        }
        response.prediction.ok_or_else(|| {
            InferenceError::MalformedEngineOutput("successful response without prediction".into())
        })
    }
}
