use cxr_shared::DicomMetadata;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use ndarray::Array2;
use serde::Serialize;

use super::dicom::{self, DicomPath};
use super::{ImageFormat, NormalizeError, RawImage};
use crate::config::ImagingConfig;

const LARGE_EDGE_WARNING: u32 = 5000;

/// Classifier-ready tensor: `target_size` square, one channel, values in the
/// configured intensity range.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    pub pixels: Array2<f32>,
    pub source: ImageFormat,
    pub metadata: Option<DicomMetadata>,
}

impl NormalizedImage {
    pub fn width(&self) -> u32 {
        self.pixels.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.pixels.nrows() as u32
    }

    /// Row-major little-endian f32 bytes, the worker wire layout.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageInspection {
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub warnings: Vec<String>,
    pub dicom_metadata: Option<DicomMetadata>,
}

struct Decoded {
    image: GrayImage,
    dicom_path: Option<DicomPath>,
    metadata: Option<DicomMetadata>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    target_size: u32,
    min_edge: u32,
    max_bytes: usize,
    range: (f32, f32),
}

impl Normalizer {
    pub fn new(config: &ImagingConfig) -> Self {
        let [low, high] = config.intensity_range;
        Self {
            target_size: config.target_size,
            min_edge: config.min_edge,
            max_bytes: config.max_bytes,
            range: (low, high),
        }
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    pub fn min_edge(&self) -> u32 {
        self.min_edge
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn normalize(&self, raw: &RawImage) -> Result<NormalizedImage, NormalizeError> {
        let decoded = self.decode(raw)?;
        self.check_dimensions(decoded.image.dimensions())?;

        let resized = DynamicImage::ImageLuma8(decoded.image).resize_to_fill(
            self.target_size,
            self.target_size,
            FilterType::Lanczos3,
        );
        let gray = resized.to_luma8();

        Ok(NormalizedImage {
            pixels: self.stretch(&gray),
            source: raw.format,
            metadata: decoded.metadata,
        })
    }

    /// Decodes far enough to report what the normalizer would see, without
    /// failing on size limits that only matter for inference.
    pub fn inspect(&self, raw: &RawImage) -> Result<ImageInspection, NormalizeError> {
        let decoded = self.decode(raw)?;
        let (width, height) = decoded.image.dimensions();
        let mut warnings = Vec::new();

        if width.min(height) < self.min_edge {
            warnings.push(format!(
                "Image is {}x{}, below the {}px minimum edge",
                width, height, self.min_edge
            ));
        }
        if width > LARGE_EDGE_WARNING || height > LARGE_EDGE_WARNING {
            warnings.push(format!(
                "Large image ({}x{}) may slow processing",
                width, height
            ));
        }
        match decoded.dicom_path {
            Some(DicomPath::EmbeddedFragment) => warnings
                .push("Compressed DICOM pixel data decoded best-effort from its first fragment".into()),
            Some(DicomPath::PhotographicExport) => warnings
                .push("File declared as DICOM but decoded as a photographic export".into()),
            _ => {}
        }
        if !raw.format.is_medical() {
            warnings.push("Photographic image; DICOM is preferred for diagnostic use".into());
        }

        Ok(ImageInspection {
            format: raw.format.to_string(),
            width,
            height,
            warnings,
            dicom_metadata: decoded.metadata,
        })
    }

    fn decode(&self, raw: &RawImage) -> Result<Decoded, NormalizeError> {
        if raw.bytes.len() > self.max_bytes {
            return Err(NormalizeError::PayloadTooLarge {
                size: raw.bytes.len(),
                limit: self.max_bytes,
            });
        }
        if raw.bytes.is_empty() {
            return Err(NormalizeError::CorruptImage("Empty upload".into()));
        }

        match raw.format {
            ImageFormat::Dicom => {
                let decoded = dicom::decode(&raw.bytes)?;
                log::debug!("DICOM {} decoded via {:?}", raw.filename, decoded.path);
                Ok(Decoded {
                    image: decoded.image,
                    dicom_path: Some(decoded.path),
                    metadata: decoded.metadata,
                })
            }
            ImageFormat::Png | ImageFormat::Jpeg => {
                let img = image::load_from_memory(&raw.bytes)
                    .map_err(|e| NormalizeError::CorruptImage(e.to_string()))?;
                Ok(Decoded {
                    image: img.to_luma8(),
                    dicom_path: None,
                    metadata: None,
                })
            }
        }
    }

    fn check_dimensions(&self, (width, height): (u32, u32)) -> Result<(), NormalizeError> {
        if width.min(height) < self.min_edge {
            return Err(NormalizeError::ImageTooSmall {
                width,
                height,
                min_edge: self.min_edge,
            });
        }
        Ok(())
    }

    fn stretch(&self, gray: &GrayImage) -> Array2<f32> {
        let (low, high) = self.range;
        let (min, max) = gray
            .pixels()
            .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
        let span = max.saturating_sub(min) as f32;

        let (width, height) = gray.dimensions();
        Array2::from_shape_fn((height as usize, width as usize), |(row, col)| {
            if span == 0.0 {
                return low;
            }
            let v = gray.get_pixel(col as u32, row as u32)[0];
            low + (v - min) as f32 / span * (high - low)
        })
    }
}
