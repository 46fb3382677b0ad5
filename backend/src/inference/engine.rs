use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{EngineInfo, InferenceError, RawPrediction};
use crate::imaging::NormalizedImage;

/// A classifier behind an isolation boundary. Implementations decide whether
/// that boundary is a thread or a process.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> String;

    /// One-time readiness check: load weights, verify the runtime.
    async fn initialize(&self) -> Result<EngineInfo, InferenceError>;

    async fn predict(&self, image: &NormalizedImage) -> Result<RawPrediction, InferenceError>;
}

/// Synchronous model that can run on the blocking pool.
pub trait Classifier: Send + Sync + 'static {
    fn load(&self) -> Result<EngineInfo, InferenceError>;

    fn classify(&self, image: &NormalizedImage) -> Result<RawPrediction, InferenceError>;
}

pub struct InProcessEngine<C> {
    classifier: Arc<C>,
    timeout: Duration,
    init_timeout: Duration,
    name: String,
}

impl<C: Classifier> InProcessEngine<C> {
    /// `timeout` bounds each prediction, `init_timeout` the one-time load.
    pub fn new(
        classifier: C,
        name: impl Into<String>,
        timeout: Duration,
        init_timeout: Duration,
    ) -> Self {
        Self {
            classifier: Arc::new(classifier),
            timeout,
            init_timeout,
            name: name.into(),
        }
    }

    async fn run_blocking<T, F>(&self, limit: Duration, job: F) -> Result<T, InferenceError>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> Result<T, InferenceError> + Send + 'static,
    {
        let classifier = self.classifier.clone();
        let task = tokio::task::spawn_blocking(move || job(classifier.as_ref()));
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                log::error!("Classifier {} crashed: {}", self.name, join_err);
                Err(InferenceError::MalformedEngineOutput(format!(
                    "classifier crashed: {}",
                    join_err
                )))
            }
            Err(_) => Err(InferenceError::InferenceTimeout(limit)),
        }
    }
}

#[async_trait]
impl<C: Classifier> InferenceEngine for InProcessEngine<C> {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn initialize(&self) -> Result<EngineInfo, InferenceError> {
        self.run_blocking(self.init_timeout, |classifier| classifier.load())
            .await
    }

    async fn predict(&self, image: &NormalizedImage) -> Result<RawPrediction, InferenceError> {
        let image = image.clone();
        self.run_blocking(self.timeout, move |classifier| classifier.classify(&image))
            .await
    }
}

/// Engine that never becomes ready, for deployments whose configured
/// engine cannot be built. Every request degrades.
pub struct DisabledEngine {
    name: String,
    reason: String,
}

impl DisabledEngine {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl InferenceEngine for DisabledEngine {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn initialize(&self) -> Result<EngineInfo, InferenceError> {
        Err(InferenceError::EngineUnavailable(self.reason.clone()))
    }

    async fn predict(&self, _image: &NormalizedImage) -> Result<RawPrediction, InferenceError> {
        Err(InferenceError::EngineUnavailable(self.reason.clone()))
    }
}
