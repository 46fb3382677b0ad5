mod dicom;
mod normalize;

pub use normalize::{ImageInspection, NormalizedImage, Normalizer};

use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Corrupt image: {0}")]
    CorruptImage(String),
    #[error("Image too small: {width}x{height}, minimum edge is {min_edge}px")]
    ImageTooSmall {
        width: u32,
        height: u32,
        min_edge: u32,
    },
    #[error("Payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Encodings accepted at the door. Anything else is rejected before decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Dicom,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 3] = [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Dicom];

    pub fn from_extension(ext: &str) -> Result<Self, NormalizeError> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            "dcm" | "dicom" => Ok(ImageFormat::Dicom),
            other => Err(NormalizeError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn from_filename(filename: &str) -> Result<Self, NormalizeError> {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .ok_or_else(|| NormalizeError::UnsupportedFormat(format!("no extension in '{}'", filename)))?;
        Self::from_extension(ext)
    }

    pub fn from_mime(mime: &str) -> Result<Self, NormalizeError> {
        match mime.to_ascii_lowercase().as_str() {
            "image/png" => Ok(ImageFormat::Png),
            "image/jpeg" | "image/jpg" => Ok(ImageFormat::Jpeg),
            "application/dicom" => Ok(ImageFormat::Dicom),
            other => Err(NormalizeError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ImageFormat::Png => &["png"],
            ImageFormat::Jpeg => &["jpg", "jpeg"],
            ImageFormat::Dicom => &["dcm", "dicom"],
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Dicom => "application/dicom",
        }
    }

    pub fn is_medical(&self) -> bool {
        matches!(self, ImageFormat::Dicom)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Dicom => "dicom",
        };
        f.write_str(name)
    }
}

/// Uploaded bytes plus the declared encoding. Lives for one request.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub filename: String,
}

impl RawImage {
    pub fn new(bytes: Vec<u8>, format: ImageFormat, filename: impl Into<String>) -> Self {
        Self {
            bytes,
            format,
            filename: filename.into(),
        }
    }

    /// Resolves the format from the filename extension. The part's MIME type
    /// is consulted only when the filename has no extension at all.
    pub fn from_upload(
        bytes: Vec<u8>,
        filename: &str,
        mime: Option<&str>,
    ) -> Result<Self, NormalizeError> {
        let format = match (filename.rsplit_once('.'), mime) {
            (Some((_, ext)), _) => ImageFormat::from_extension(ext)?,
            (None, Some(mime)) => ImageFormat::from_mime(mime)?,
            (None, None) => ImageFormat::from_filename(filename)?,
        };
        Ok(Self::new(bytes, format, filename))
    }

    pub fn sha256(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }
}
