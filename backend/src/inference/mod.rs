mod engine;
mod prediction;
#[cfg(feature = "torch")]
mod torch;
mod worker;

pub use engine::{Classifier, DisabledEngine, InProcessEngine, InferenceEngine};
pub use prediction::RawPrediction;
#[cfg(feature = "torch")]
pub use torch::TorchClassifier;
pub use worker::SubprocessEngine;

use std::sync::Arc;
use std::time::Duration;

use cxr_shared::{DegradedInference, Prediction};
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::config::{EngineConfig, EngineKind, LabelConfig};
use crate::imaging::NormalizedImage;

/// Builds the configured engine. Misconfiguration yields an engine that
/// reports itself unavailable, so the service still starts in degraded mode.
pub fn engine_from_config(config: &EngineConfig, labels: &LabelConfig) -> Arc<dyn InferenceEngine> {
    match config.kind {
        EngineKind::Subprocess => Arc::new(SubprocessEngine::new(config)),
        #[cfg(feature = "torch")]
        EngineKind::Torch => match &config.model_path {
            Some(path) => Arc::new(InProcessEngine::new(
                TorchClassifier::new(path, &labels.positive, config.positive_index),
                "torchscript",
                config.timeout(),
                config.init_timeout(),
            )),
            None => Arc::new(DisabledEngine::new("torchscript", "engine.model_path is not set")),
        },
        #[cfg(not(feature = "torch"))]
        EngineKind::Torch => {
            let _ = labels;
            Arc::new(DisabledEngine::new(
                "torchscript",
                "built without the `torch` feature",
            ))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("Inference timed out after {0:?}")]
    InferenceTimeout(Duration),
    #[error("Malformed engine output: {0}")]
    MalformedEngineOutput(String),
}

/// Identity reported by the engine once it has loaded.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineInfo {
    pub name: String,
    pub version: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl EngineInfo {
    pub fn label(&self) -> String {
        match &self.version {
            Some(version) => format!("{} {}", self.name, version),
            None => self.name.clone(),
        }
    }
}

/// Decided exactly once per process.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    Ready(EngineInfo),
    Unavailable(String),
}

impl EngineStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, EngineStatus::Ready(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inference {
    Completed(Prediction),
    Degraded(DegradedInference),
}

/// Process-wide handle to the classifier. Built once in `main` and shared
/// with every request through `Arc`.
pub struct EngineHandle {
    engine: Arc<dyn InferenceEngine>,
    labels: LabelConfig,
    init_timeout: Duration,
    status: OnceCell<EngineStatus>,
}

impl EngineHandle {
    pub fn new(engine: Arc<dyn InferenceEngine>, labels: LabelConfig, init_timeout: Duration) -> Self {
        Self {
            engine,
            labels,
            init_timeout,
            status: OnceCell::new(),
        }
    }

    pub fn labels(&self) -> &LabelConfig {
        &self.labels
    }

    /// Runs the readiness check on first call; later and concurrent callers
    /// observe the same outcome.
    pub async fn initialize(&self) -> &EngineStatus {
        self.status
            .get_or_init(|| async {
                let name = self.engine.name();
                match tokio::time::timeout(self.init_timeout, self.engine.initialize()).await {
                    Ok(Ok(info)) => {
                        log::info!("Inference engine ready: {}", info.label());
                        EngineStatus::Ready(info)
                    }
                    Ok(Err(e)) => {
                        log::error!("Inference engine {} failed to initialize: {}", name, e);
                        EngineStatus::Unavailable(e.to_string())
                    }
                    Err(_) => {
                        log::error!(
                            "Inference engine {} did not initialize within {:?}",
                            name,
                            self.init_timeout
                        );
                        EngineStatus::Unavailable(format!(
                            "initialization timed out after {:?}",
                            self.init_timeout
                        ))
                    }
                }
            })
            .await
    }

    pub fn status(&self) -> Option<&EngineStatus> {
        self.status.get()
    }

    pub async fn infer(&self, image: &NormalizedImage) -> Result<Inference, InferenceError> {
        let info = match self.initialize().await {
            EngineStatus::Ready(info) => info,
            EngineStatus::Unavailable(reason) => {
                return Ok(Inference::Degraded(self.degraded(reason.clone())));
            }
        };

        match self.engine.predict(image).await {
            Ok(raw) => {
                let prediction = raw.into_prediction(
                    &self.labels,
                    &info.label(),
                    (image.width(), image.height()),
                )?;
                Ok(Inference::Completed(prediction))
            }
            Err(InferenceError::EngineUnavailable(reason)) => {
                log::warn!("Engine unavailable for this request: {}", reason);
                Ok(Inference::Degraded(self.degraded(reason)))
            }
            Err(e) => Err(e),
        }
    }

    fn degraded(&self, reason: String) -> DegradedInference {
        DegradedInference {
            reason,
            engine: self.engine.name(),
        }
    }
}
