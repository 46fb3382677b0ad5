mod common;

use std::sync::Arc;

use common::*;
use cxr_backend::imaging::{NormalizeError, RawImage};
use cxr_backend::inference::{DisabledEngine, EngineHandle, Inference};
use cxr_backend::pipeline::{PipelineError, PipelineState};
use cxr_backend::report::MISSING_SECTION;
use cxr_shared::{Analysis, MEDICAL_DISCLAIMER, PatientContext, Provenance, Severity};

fn chest(filename: &str) -> RawImage {
    RawImage::from_upload(chest_png(), filename, Some("image/png")).unwrap()
}

#[tokio::test]
async fn confident_positive_gets_remote_report() {
    let engine = FixedEngine::ready(0.92);
    let service = ScriptedService::healthy();
    let pipeline = pipeline(engine.clone(), service.clone());

    let record = pipeline
        .analyze(chest("chest.png"), &PatientContext::default())
        .await
        .unwrap();

    let Analysis::Reported {
        prediction,
        eligibility,
        report,
    } = &record.analysis
    else {
        panic!("expected a report, got {:?}", record.analysis);
    };
    assert_eq!(prediction.label, POSITIVE);
    assert!((prediction.confidence - 0.92).abs() < 1e-6);
    assert!(eligibility.eligible);
    assert_eq!(report.provenance, Provenance::Remote);
    assert_eq!(report.metadata.attempts, 1);
    assert_eq!(report.metadata.engine, "fixed-cnn 2");
    for section in [
        &report.sections.findings,
        &report.sections.impression,
        &report.sections.recommendations,
    ] {
        assert!(!section.is_empty());
        assert_ne!(section, MISSING_SECTION);
    }
    assert_eq!(report.disclaimer, MEDICAL_DISCLAIMER);
    assert_eq!(service.calls(), 1);
    assert_eq!(record.severity, Some(Severity::High));
    assert!(record.dicom_metadata.is_none());
    assert_eq!(
        record.trail,
        vec![
            PipelineState::Received,
            PipelineState::Normalizing,
            PipelineState::Inferring,
            PipelineState::Eligible,
            PipelineState::Generating,
            PipelineState::RemoteSucceeded,
            PipelineState::Assembled,
            PipelineState::Done,
        ]
    );
}

#[tokio::test]
async fn confident_negative_is_not_reported() {
    let service = ScriptedService::healthy();
    let pipeline = pipeline(FixedEngine::ready(0.09), service.clone());

    let record = pipeline
        .analyze(chest("chest.png"), &PatientContext::default())
        .await
        .unwrap();

    let Analysis::Ineligible {
        prediction,
        eligibility,
    } = &record.analysis
    else {
        panic!("expected ineligible, got {:?}", record.analysis);
    };
    assert_eq!(prediction.label, NEGATIVE);
    assert!((prediction.confidence - 0.91).abs() < 1e-6);
    assert!(!eligibility.eligible);
    assert_eq!(eligibility.positive_label, POSITIVE);
    assert_eq!(record.severity, Some(Severity::None));
    assert!(record.analysis.report().is_none());
    assert_eq!(service.calls(), 0);
    assert!(record.trail.contains(&PipelineState::Ineligible));
    assert!(!record.trail.contains(&PipelineState::Generating));
}

#[tokio::test]
async fn failing_service_falls_back_after_three_attempts() {
    let service = ScriptedService::failing();
    let pipeline = pipeline(FixedEngine::ready(0.92), service.clone());

    let record = pipeline
        .analyze(chest("chest.png"), &PatientContext::default())
        .await
        .unwrap();

    let report = record.analysis.report().expect("fallback report");
    assert_eq!(service.calls(), 3);
    assert_eq!(report.provenance, Provenance::Fallback);
    assert_eq!(report.metadata.attempts, 3);
    assert!(report.narrative.contains(POSITIVE));
    assert!(report.narrative.contains("92.0%"));
    assert!(report.full_text().ends_with(MEDICAL_DISCLAIMER));
    assert!(record.trail.contains(&PipelineState::FallbackUsed));
}

#[tokio::test]
async fn dicom_study_carries_header_metadata() {
    let engine = FixedEngine::ready(0.85);
    let pipeline = pipeline(engine.clone(), ScriptedService::healthy());

    let raw = RawImage::from_upload(chest_dicom(), "study.dcm", Some("application/dicom")).unwrap();
    let record = pipeline.analyze(raw, &PatientContext::default()).await.unwrap();

    assert!(record.analysis.report().is_some());
    assert_eq!(record.severity, Some(Severity::Moderate));
    let metadata = record.dicom_metadata.clone().unwrap();
    assert_eq!(metadata.modality.as_deref(), Some("CR"));
    assert_eq!(metadata.view_position.as_deref(), Some("PA"));
    assert_eq!(metadata.image_size.as_deref(), Some("512x512"));

    let response = record.into_response();
    assert_eq!(response.format, "dicom");
    assert!(response.has_dicom_metadata);
    assert_eq!(engine.predictions(), 1);
}

#[tokio::test]
async fn unknown_extension_is_rejected_before_inference() {
    let engine = FixedEngine::ready(0.92);
    let pipeline = pipeline(engine.clone(), ScriptedService::healthy());

    // A supported MIME type does not rescue an unsupported extension.
    let mut rejected = Vec::new();
    for (filename, mime) in [("chest.tif", Some("image/png")), ("chest.png", Some("image/png"))] {
        let outcome = match RawImage::from_upload(chest_png(), filename, mime) {
            Ok(raw) => pipeline
                .analyze(raw, &PatientContext::default())
                .await
                .map(|_| ()),
            Err(err) => {
                assert!(matches!(err, NormalizeError::UnsupportedFormat(ref ext) if ext == "tif"));
                Err(PipelineError::from(err))
            }
        };
        if let Err(err) = outcome {
            rejected.push((filename, err.kind()));
        }
    }

    assert_eq!(rejected, vec![("chest.tif", "unsupported_format")]);
    assert_eq!(engine.predictions(), 1);
}

#[tokio::test]
async fn undecodable_image_fails_before_inference() {
    let engine = FixedEngine::ready(0.92);
    let pipeline = pipeline(engine.clone(), ScriptedService::healthy());

    let raw = RawImage::from_upload(b"\x89PNG garbage".to_vec(), "chest.png", None).unwrap();
    let err = pipeline
        .analyze(raw, &PatientContext::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "corrupt_image");
    assert_eq!(engine.predictions(), 0);
}

#[tokio::test]
async fn failed_initialization_degrades_every_request() {
    let engine = FixedEngine::broken();
    let service = ScriptedService::healthy();
    let pipeline = pipeline(engine.clone(), service.clone());

    for _ in 0..3 {
        let record = pipeline
            .analyze(chest("chest.png"), &PatientContext::default())
            .await
            .unwrap();
        let Analysis::Degraded(marker) = &record.analysis else {
            panic!("expected degraded marker, got {:?}", record.analysis);
        };
        assert!(marker.reason.contains("model weights not found"));
        assert_eq!(record.trail.last(), Some(&PipelineState::Done));
        assert!(record.trail.contains(&PipelineState::Degraded));
        assert_eq!(record.severity, None);
    }
    assert_eq!(engine.init_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(engine.predictions(), 0);
    assert_eq!(service.calls(), 0);
}

#[tokio::test]
async fn disabled_engine_resolves_immediately() {
    let handle = EngineHandle::new(
        Arc::new(DisabledEngine::new("torchscript", "built without the `torch` feature")),
        labels(),
        std::time::Duration::from_secs(5),
    );
    assert!(!handle.initialize().await.is_ready());

    let image = cxr_backend::imaging::Normalizer::new(&Default::default())
        .normalize(&chest("chest.png"))
        .unwrap();
    match handle.infer(&image).await.unwrap() {
        Inference::Degraded(marker) => assert_eq!(marker.engine, "torchscript"),
        other => panic!("expected degraded marker, got {:?}", other),
    }
}

#[tokio::test]
async fn concurrent_requests_share_one_engine() {
    let engine = FixedEngine::ready(0.95);
    let pipeline = Arc::new(pipeline(engine.clone(), ScriptedService::healthy()));

    let tasks: Vec<_> = (0..6)
        .map(|i| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .analyze(chest(&format!("chest-{}.png", i)), &PatientContext::default())
                    .await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        let record = task.await.unwrap().unwrap();
        assert!(record.analysis.report().is_some());
        ids.push(record.request_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 6);
    assert_eq!(engine.init_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(engine.predictions(), 6);
}
