use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Attached verbatim to every report, whichever path produced it.
pub const MEDICAL_DISCLAIMER: &str = "This report was generated with the assistance of artificial intelligence. \
It must be reviewed and validated by a qualified physician before clinical use. \
It does not replace professional medical judgement.";

/// Same-sized heat-intensity overlay, single channel, PNG encoded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SaliencyMap {
    pub width: u32,
    pub height: u32,
    pub png_base64: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
    pub scores: BTreeMap<String, f32>,
    pub saliency: Option<SaliencyMap>,
    /// Identity of the engine that produced the scores.
    pub engine: String,
}

impl Prediction {
    pub fn score(&self, label: &str) -> Option<f32> {
        self.scores.get(label).copied()
    }
}

/// Returned in place of a prediction while the classifier is unavailable.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DegradedInference {
    pub reason: String,
    pub engine: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReportEligibility {
    pub eligible: bool,
    pub threshold: f32,
    pub positive_label: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Provenance {
    Remote,
    Fallback,
}

/// Coarse grading of a prediction for case triage.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    None,
    Mild,
    Moderate,
    High,
}

impl Severity {
    pub fn grade(positive: bool, confidence: f32) -> Self {
        match (positive, confidence) {
            (false, _) => Severity::None,
            (true, c) if c >= 0.9 => Severity::High,
            (true, c) if c >= 0.8 => Severity::Moderate,
            (true, _) => Severity::Mild,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReportSections {
    pub findings: String,
    pub impression: String,
    pub recommendations: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    pub model: String,
    pub source_label: String,
    pub source_confidence: f32,
    pub engine: String,
    pub attempts: u32,
    pub language: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QualityMetrics {
    pub word_count: usize,
    pub completeness: f32,
    pub structure: f32,
    pub section_completeness: f32,
    pub overall: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GeneratedReport {
    pub report_id: Uuid,
    /// Raw text as produced, never edited.
    pub narrative: String,
    pub sections: ReportSections,
    pub metadata: ReportMetadata,
    pub disclaimer: String,
    pub provenance: Provenance,
    pub quality: QualityMetrics,
    pub follow_up: Vec<String>,
}

impl GeneratedReport {
    pub fn full_text(&self) -> String {
        format!("{}\n\n{}", self.narrative.trim_end(), self.disclaimer)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PatientContext {
    pub age: Option<u8>,
    #[serde(alias = "gender")]
    pub sex: Option<String>,
    pub symptoms: Option<String>,
    pub clinical_history: Option<String>,
}

/// Study attributes read from a DICOM header. Absent attributes are omitted.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DicomMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_age: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_sex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_part: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_position: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Analysis {
    Degraded(DegradedInference),
    Ineligible {
        prediction: Prediction,
        eligibility: ReportEligibility,
    },
    Reported {
        prediction: Prediction,
        eligibility: ReportEligibility,
        report: Box<GeneratedReport>,
    },
}

impl Analysis {
    pub fn report(&self) -> Option<&GeneratedReport> {
        match self {
            Analysis::Reported { report, .. } => Some(report.as_ref()),
            _ => None,
        }
    }

    pub fn prediction(&self) -> Option<&Prediction> {
        match self {
            Analysis::Ineligible { prediction, .. } | Analysis::Reported { prediction, .. } => {
                Some(prediction)
            }
            Analysis::Degraded(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AnalysisResponse {
    pub request_id: Uuid,
    pub filename: String,
    pub image_sha256: String,
    pub format: String,
    pub trail: Vec<String>,
    pub analysis: Analysis,
    /// Absent when the engine was unavailable.
    pub severity: Option<Severity>,
    pub has_dicom_metadata: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dicom_metadata: Option<DicomMetadata>,
}
