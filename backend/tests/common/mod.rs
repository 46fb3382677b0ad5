#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cxr_backend::config::{ImagingConfig, LabelConfig, ReportConfig, RetryConfig};
use cxr_backend::gate::DecisionGate;
use cxr_backend::imaging::{NormalizedImage, Normalizer};
use cxr_backend::inference::{EngineHandle, EngineInfo, InferenceEngine, InferenceError, RawPrediction};
use cxr_backend::pipeline::Pipeline;
use cxr_backend::report::{GenerationError, GenerationParams, ReportGenerator, TextGenerator};
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use image::{DynamicImage, GrayImage, Luma};

pub const POSITIVE: &str = "Positive";
pub const NEGATIVE: &str = "Negative";

pub const REMOTE_TEXT: &str = "\
## RADIOLOGICAL FINDINGS:
Patchy consolidation in the right lower lobe.

## DIAGNOSTIC IMPRESSION:
Findings consistent with lobar pneumonia.

## CLINICAL RECOMMENDATIONS:
Start empirical antibiotics and repeat imaging in 6 weeks.
";

pub fn labels() -> LabelConfig {
    LabelConfig {
        positive: POSITIVE.to_string(),
        negative: NEGATIVE.to_string(),
    }
}

/// 512x512 grayscale gradient, encoded as PNG.
pub fn chest_png() -> Vec<u8> {
    let img = GrayImage::from_fn(512, 512, |x, y| Luma([((x * 3 + y) % 256) as u8]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// 512x512 MONOCHROME2 chest radiograph, 16 bits allocated, with a
/// CR modality and PA view in its header.
pub fn chest_dicom() -> Vec<u8> {
    let pixels: Vec<u8> = (0..512u32 * 512)
        .map(|i| ((i % 512) * 8 + (i / 512) * 4) as u16)
        .flat_map(|v| v.to_le_bytes())
        .collect();

    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        PrimitiveValue::from(uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from("2.25.424242"),
    ));
    obj.put(DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CR")));
    obj.put(DataElement::new(tags::VIEW_POSITION, VR::CS, PrimitiveValue::from("PA")));
    obj.put(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        PrimitiveValue::from("MONOCHROME2"),
    ));
    for (tag, value) in [
        (tags::SAMPLES_PER_PIXEL, 1_u16),
        (tags::ROWS, 512),
        (tags::COLUMNS, 512),
        (tags::BITS_ALLOCATED, 16),
        (tags::BITS_STORED, 16),
        (tags::HIGH_BIT, 15),
        (tags::PIXEL_REPRESENTATION, 0),
    ] {
        obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
    }
    obj.put(DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(pixels)));

    let mut buf = Vec::new();
    obj.with_meta(FileMetaTableBuilder::new().transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN))
        .unwrap()
        .write_all(&mut buf)
        .unwrap();
    buf
}

/// Engine double returning a fixed positive-class probability.
pub struct FixedEngine {
    positive: f32,
    ready: bool,
    pub init_calls: AtomicUsize,
    pub predict_calls: AtomicUsize,
}

impl FixedEngine {
    pub fn ready(positive: f32) -> Arc<Self> {
        Arc::new(Self {
            positive,
            ready: true,
            init_calls: AtomicUsize::new(0),
            predict_calls: AtomicUsize::new(0),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            positive: 0.0,
            ready: false,
            init_calls: AtomicUsize::new(0),
            predict_calls: AtomicUsize::new(0),
        })
    }

    pub fn predictions(&self) -> usize {
        self.predict_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for FixedEngine {
    fn name(&self) -> String {
        "fixed".to_string()
    }

    async fn initialize(&self) -> Result<EngineInfo, InferenceError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.ready {
            Ok(EngineInfo {
                name: "fixed-cnn".into(),
                version: Some("2".into()),
                details: None,
            })
        } else {
            Err(InferenceError::EngineUnavailable("model weights not found".into()))
        }
    }

    async fn predict(&self, image: &NormalizedImage) -> Result<RawPrediction, InferenceError> {
        assert_eq!((image.width(), image.height()), (224, 224));
        self.predict_calls.fetch_add(1, Ordering::SeqCst);
        Ok(RawPrediction {
            class_probabilities: BTreeMap::from([(POSITIVE.to_string(), self.positive)]),
            ..RawPrediction::default()
        })
    }
}

/// Report service double replaying scripted outcomes; the last one repeats.
pub struct ScriptedService {
    outcomes: Mutex<VecDeque<Result<String, GenerationError>>>,
    calls: AtomicUsize,
}

impl ScriptedService {
    pub fn new(outcomes: Vec<Result<String, GenerationError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::new(vec![Ok(REMOTE_TEXT.to_string())])
    }

    pub fn failing() -> Arc<Self> {
        Self::new(vec![Err(GenerationError::Server {
            status: 500,
            body: "internal error".into(),
        })])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for ScriptedService {
    fn model_id(&self) -> &str {
        "scripted-medgemma"
    }

    async fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String, GenerationError> {
        assert!(!prompt.is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.len() > 1 {
            outcomes.pop_front().unwrap()
        } else {
            outcomes.front().cloned().unwrap()
        }
    }
}

/// Report config with the retry delays zeroed so tests run in real time.
pub fn fast_report_config() -> ReportConfig {
    ReportConfig {
        retry: RetryConfig {
            warmup_delay_secs: 0,
            warmup_max_delay_secs: 0,
            transient_delay_secs: 0,
            ..RetryConfig::default()
        },
        ..ReportConfig::default()
    }
}

pub fn pipeline(engine: Arc<dyn InferenceEngine>, service: Arc<dyn TextGenerator>) -> Pipeline {
    let handle = Arc::new(EngineHandle::new(engine, labels(), Duration::from_secs(5)));
    Pipeline::new(
        Normalizer::new(&ImagingConfig::default()),
        handle,
        DecisionGate::new(0.8, POSITIVE),
        ReportGenerator::new(service, &fast_report_config()),
    )
}
