use std::fmt;
use std::sync::Arc;

use cxr_shared::{Analysis, AnalysisResponse, DicomMetadata, PatientContext, Severity};
use uuid::Uuid;

use crate::gate::DecisionGate;
use crate::imaging::{ImageFormat, NormalizeError, Normalizer, RawImage};
use crate::inference::{EngineHandle, Inference, InferenceError};
use crate::report::ReportGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Normalizing,
    Inferring,
    Degraded,
    Ineligible,
    Eligible,
    Generating,
    RemoteSucceeded,
    FallbackUsed,
    Assembled,
    Done,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Received => "received",
            PipelineState::Normalizing => "normalizing",
            PipelineState::Inferring => "inferring",
            PipelineState::Degraded => "degraded",
            PipelineState::Ineligible => "ineligible",
            PipelineState::Eligible => "eligible",
            PipelineState::Generating => "generating",
            PipelineState::RemoteSucceeded => "remote_succeeded",
            PipelineState::FallbackUsed => "fallback_used",
            PipelineState::Assembled => "assembled",
            PipelineState::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Input(#[from] NormalizeError),
    #[error(transparent)]
    Engine(#[from] InferenceError),
    #[error("Normalization task failed: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Input(NormalizeError::UnsupportedFormat(_)) => "unsupported_format",
            PipelineError::Input(NormalizeError::CorruptImage(_)) => "corrupt_image",
            PipelineError::Input(NormalizeError::ImageTooSmall { .. }) => "image_too_small",
            PipelineError::Input(NormalizeError::PayloadTooLarge { .. }) => "payload_too_large",
            PipelineError::Engine(InferenceError::EngineUnavailable(_)) => "engine_unavailable",
            PipelineError::Engine(InferenceError::InferenceTimeout(_)) => "inference_timeout",
            PipelineError::Engine(InferenceError::MalformedEngineOutput(_)) => "malformed_engine_output",
            PipelineError::Internal(_) => "internal",
        }
    }
}

/// Outcome of one request plus the states it went through.
#[derive(Debug, Clone)]
pub struct AnalysisRecord {
    pub request_id: Uuid,
    pub filename: String,
    pub image_sha256: String,
    pub format: ImageFormat,
    pub trail: Vec<PipelineState>,
    pub analysis: Analysis,
    /// `None` when no prediction was made.
    pub severity: Option<Severity>,
    pub dicom_metadata: Option<DicomMetadata>,
}

impl AnalysisRecord {
    pub fn into_response(self) -> AnalysisResponse {
        AnalysisResponse {
            request_id: self.request_id,
            filename: self.filename,
            image_sha256: self.image_sha256,
            format: self.format.to_string(),
            trail: self.trail.iter().map(ToString::to_string).collect(),
            analysis: self.analysis,
            severity: self.severity,
            has_dicom_metadata: self.dicom_metadata.is_some(),
            dicom_metadata: self.dicom_metadata,
        }
    }
}

struct Trail {
    request_id: Uuid,
    states: Vec<PipelineState>,
}

impl Trail {
    fn start(request_id: Uuid) -> Self {
        let mut trail = Self {
            request_id,
            states: Vec::new(),
        };
        trail.enter(PipelineState::Received);
        trail
    }

    fn enter(&mut self, state: PipelineState) {
        log::debug!("[{}] -> {}", self.request_id, state);
        self.states.push(state);
    }
}

/// Request-scoped orchestration over shared, read-only components.
pub struct Pipeline {
    normalizer: Normalizer,
    engine: Arc<EngineHandle>,
    gate: DecisionGate,
    reports: ReportGenerator,
}

impl Pipeline {
    pub fn new(
        normalizer: Normalizer,
        engine: Arc<EngineHandle>,
        gate: DecisionGate,
        reports: ReportGenerator,
    ) -> Self {
        Self {
            normalizer,
            engine,
            gate,
            reports,
        }
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn gate(&self) -> &DecisionGate {
        &self.gate
    }

    pub fn reports(&self) -> &ReportGenerator {
        &self.reports
    }

    pub async fn analyze(
        &self,
        raw: RawImage,
        patient: &PatientContext,
    ) -> Result<AnalysisRecord, PipelineError> {
        let request_id = Uuid::new_v4();
        let mut trail = Trail::start(request_id);
        let image_sha256 = raw.sha256();
        let filename = raw.filename.clone();
        let format = raw.format;
        log::info!(
            "[{}] Analyzing {} ({}, {} bytes, sha256 {})",
            request_id,
            filename,
            format,
            raw.bytes.len(),
            &image_sha256[..12]
        );

        trail.enter(PipelineState::Normalizing);
        let normalizer = self.normalizer.clone();
        let image = tokio::task::spawn_blocking(move || normalizer.normalize(&raw))
            .await
            .map_err(|e| PipelineError::Internal(e.to_string()))??;

        trail.enter(PipelineState::Inferring);
        let mut severity = None;
        let analysis = match self.engine.infer(&image).await? {
            Inference::Degraded(marker) => {
                log::warn!("[{}] Degraded inference: {}", request_id, marker.reason);
                trail.enter(PipelineState::Degraded);
                Analysis::Degraded(marker)
            }
            Inference::Completed(prediction) => {
                log::info!(
                    "[{}] Prediction {} ({:.3})",
                    request_id,
                    prediction.label,
                    prediction.confidence
                );
                severity = Some(self.gate.severity(&prediction));
                match self.gate.admit(&prediction) {
                    None => {
                        trail.enter(PipelineState::Ineligible);
                        Analysis::Ineligible {
                            eligibility: self.gate.evaluate(&prediction),
                            prediction,
                        }
                    }
                    Some(eligible) => {
                        trail.enter(PipelineState::Eligible);
                        trail.enter(PipelineState::Generating);
                        let report = self.reports.generate(&eligible, patient).await;
                        trail.enter(match report.provenance {
                            cxr_shared::Provenance::Remote => PipelineState::RemoteSucceeded,
                            cxr_shared::Provenance::Fallback => PipelineState::FallbackUsed,
                        });
                        trail.enter(PipelineState::Assembled);
                        let (prediction, eligibility) = eligible.into_parts();
                        Analysis::Reported {
                            prediction,
                            eligibility,
                            report: Box::new(report),
                        }
                    }
                }
            }
        };
        trail.enter(PipelineState::Done);

        Ok(AnalysisRecord {
            request_id,
            filename,
            image_sha256,
            format,
            trail: trail.states,
            analysis,
            severity,
            dicom_metadata: image.metadata,
        })
    }
}
