use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tch::{CModule, Device, Kind, Tensor, nn::ModuleT};

use super::{Classifier, EngineInfo, InferenceError, RawPrediction};
use crate::imaging::NormalizedImage;

/// TorchScript classifier emitting one logit per class; the configured index
/// is the positive class.
#[derive(Clone)]
pub struct TorchClassifier {
    model_path: String,
    positive_label: String,
    positive_index: usize,
    device: Device,
    model: Arc<Mutex<Option<CModule>>>,
}

impl TorchClassifier {
    pub fn new(model_path: &str, positive_label: &str, positive_index: usize) -> Self {
        Self {
            model_path: model_path.to_string(),
            positive_label: positive_label.to_string(),
            positive_index,
            device: Device::cuda_if_available(),
            model: Arc::new(Mutex::new(None)),
        }
    }
}

impl Classifier for TorchClassifier {
    fn load(&self) -> Result<EngineInfo, InferenceError> {
        let module = CModule::load_on_device(&self.model_path, self.device)
            .map_err(|e| InferenceError::EngineUnavailable(format!("{}: {}", self.model_path, e)))?;
        let mut slot = self
            .model
            .lock()
            .map_err(|_| InferenceError::EngineUnavailable("model lock poisoned".into()))?;
        *slot = Some(module);

        Ok(EngineInfo {
            name: "torchscript".to_string(),
            version: None,
            details: Some(serde_json::json!({
                "model_path": self.model_path,
                "device": format!("{:?}", self.device),
            })),
        })
    }

    fn classify(&self, image: &NormalizedImage) -> Result<RawPrediction, InferenceError> {
        let pixels: Vec<f32> = image.pixels.iter().copied().collect();
        let input = Tensor::from_slice(&pixels)
            .view([1, 1, image.height() as i64, image.width() as i64])
            .to_device(self.device);

        let guard = self
            .model
            .lock()
            .map_err(|_| InferenceError::EngineUnavailable("model lock poisoned".into()))?;
        let module = guard
            .as_ref()
            .ok_or_else(|| InferenceError::EngineUnavailable("model not loaded".into()))?;

        let output = tch::no_grad(|| module.forward_t(&input, false));
        let probabilities: Vec<f32> = output
            .sigmoid()
            .to_kind(Kind::Float)
            .view([-1])
            .try_into()
            .map_err(|e: tch::TchError| InferenceError::MalformedEngineOutput(e.to_string()))?;

        let p = probabilities.get(self.positive_index).copied().ok_or_else(|| {
            InferenceError::MalformedEngineOutput(format!(
                "model produced {} outputs, positive index is {}",
                probabilities.len(),
                self.positive_index
            ))
        })?;

        Ok(RawPrediction {
            class_probabilities: BTreeMap::from([(self.positive_label.clone(), p)]),
            ..RawPrediction::default()
        })
    }
}
