use std::collections::BTreeMap;
use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cxr_shared::{Prediction, SaliencyMap};
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};

use super::InferenceError;
use crate::config::LabelConfig;

const SUM_TOLERANCE: f32 = 0.01;

/// Engine output before validation against the label set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawPrediction {
    #[serde(default)]
    pub predicted_class: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub class_probabilities: BTreeMap<String, f32>,
    #[serde(default)]
    pub heatmap: Option<String>,
}

impl RawPrediction {
    /// Validates the binary score pair and derives the label by argmax,
    /// ties going to the positive class.
    pub fn into_prediction(
        self,
        labels: &LabelConfig,
        engine: &str,
        dims: (u32, u32),
    ) -> Result<Prediction, InferenceError> {
        let malformed = |msg: String| Err(InferenceError::MalformedEngineOutput(msg));

        for (label, score) in &self.class_probabilities {
            if label != &labels.positive && label != &labels.negative {
                return malformed(format!("unknown label '{}'", label));
            }
            if !score.is_finite() || !(0.0..=1.0).contains(score) {
                return malformed(format!("score {} for '{}' outside [0, 1]", score, label));
            }
        }

        let positive = self.class_probabilities.get(&labels.positive).copied();
        let negative = self.class_probabilities.get(&labels.negative).copied();
        let (p, n) = match (positive, negative) {
            (Some(p), Some(n)) => (p, n),
            (Some(p), None) => (p, 1.0 - p),
            (None, Some(n)) => (1.0 - n, n),
            (None, None) => return malformed("no class probabilities".into()),
        };
        if ((p + n) - 1.0).abs() > SUM_TOLERANCE {
            return malformed(format!("scores sum to {}, expected 1", p + n));
        }

        let label = if p >= n { &labels.positive } else { &labels.negative };
        if let Some(claimed) = &self.predicted_class {
            if claimed != label {
                return malformed(format!(
                    "predicted class '{}' disagrees with scores (argmax '{}')",
                    claimed, label
                ));
            }
        }

        let confidence = if p >= n { p } else { n };
        if let Some(claimed) = self.confidence {
            if (claimed - confidence).abs() > SUM_TOLERANCE {
                return malformed(format!(
                    "confidence {} disagrees with score {}",
                    claimed, confidence
                ));
            }
        }

        let saliency = self
            .heatmap
            .as_deref()
            .and_then(|encoded| match decode_saliency(encoded, dims) {
                Ok(map) => Some(map),
                Err(e) => {
                    log::warn!("Dropping undecodable saliency map: {}", e);
                    None
                }
            });

        Ok(Prediction {
            label: label.clone(),
            confidence,
            scores: BTreeMap::from([
                (labels.positive.clone(), p),
                (labels.negative.clone(), n),
            ]),
            saliency,
            engine: engine.to_string(),
        })
    }
}

/// Brings an engine heatmap to the normalized image size as single-channel PNG.
fn decode_saliency(encoded: &str, (width, height): (u32, u32)) -> Result<SaliencyMap, String> {
    let payload = match encoded.strip_prefix("data:") {
        Some(uri) => uri.split_once(',').map(|(_, data)| data).unwrap_or(""),
        None => encoded,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| format!("invalid base64: {}", e))?;
    let heatmap = image::load_from_memory(&bytes)
        .map_err(|e| format!("invalid image: {}", e))?
        .to_luma8();
    let resized = imageops::resize(&heatmap, width, height, FilterType::Triangle);

    let mut png = Cursor::new(Vec::new());
    resized
        .write_to(&mut png, image::ImageFormat::Png)
        .map_err(|e| format!("png encode failed: {}", e))?;

    Ok(SaliencyMap {
        width,
        height,
        png_base64: STANDARD.encode(png.into_inner()),
    })
}
