use cxr_shared::DicomMetadata;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::file::ReadPreamble;
use dicom_object::{DefaultDicomObject, OpenFileOptions};
use image::GrayImage;

use super::NormalizeError;

/// How the grayscale raster was obtained from a medical upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DicomPath {
    /// Native pixel data, rescaled and windowed.
    Native,
    /// First fragment of encapsulated pixel data decoded as JPEG/PNG.
    EmbeddedFragment,
    /// Not a DICOM stream at all; decoded as a photographic export.
    PhotographicExport,
}

pub(crate) struct DecodedDicom {
    pub image: GrayImage,
    pub path: DicomPath,
    /// Header attributes; absent for photographic exports.
    pub metadata: Option<DicomMetadata>,
}

struct PixelModule {
    rows: u32,
    cols: u32,
    bits_allocated: u16,
    samples_per_pixel: u16,
    signed: bool,
    rescale_slope: f64,
    rescale_intercept: f64,
    window: Option<(f64, f64)>,
    monochrome1: bool,
}

pub(crate) fn decode(bytes: &[u8]) -> Result<DecodedDicom, NormalizeError> {
    let obj = match OpenFileOptions::new()
        .read_preamble(ReadPreamble::Auto)
        .from_reader(bytes)
    {
        Ok(obj) => obj,
        Err(parse_err) => {
            log::warn!(
                "Upload is not a parsable DICOM stream ({}), trying photographic decode",
                parse_err
            );
            let image = image::load_from_memory(bytes).map_err(|decode_err| {
                NormalizeError::CorruptImage(format!(
                    "DICOM parse failed ({}) and image decode failed ({})",
                    parse_err, decode_err
                ))
            })?;
            return Ok(DecodedDicom {
                image: image.to_luma8(),
                path: DicomPath::PhotographicExport,
                metadata: None,
            });
        }
    };

    let module = read_pixel_module(&obj)?;
    let metadata = Some(read_metadata(&obj, &module));
    let pixel_data = obj
        .element(tags::PIXEL_DATA)
        .map_err(|e| NormalizeError::CorruptImage(format!("Pixel data not found: {}", e)))?;

    match pixel_data.to_bytes() {
        Ok(raw) => {
            let image = render_native(&module, &raw)?;
            Ok(DecodedDicom {
                image,
                path: DicomPath::Native,
                metadata,
            })
        }
        Err(_) => {
            // Encapsulated transfer syntax: no codec here, so try the first
            // fragment as a plain JPEG/PNG stream.
            let fragment = pixel_data
                .value()
                .fragments()
                .and_then(|fragments| fragments.first())
                .ok_or_else(|| {
                    NormalizeError::CorruptImage("Encapsulated pixel data has no fragments".into())
                })?;
            let image = image::load_from_memory(fragment).map_err(|e| {
                NormalizeError::CorruptImage(format!(
                    "Compressed pixel data could not be decoded: {}",
                    e
                ))
            })?;
            log::warn!("Decoded encapsulated DICOM pixel data from its first fragment");
            Ok(DecodedDicom {
                image: image.to_luma8(),
                path: DicomPath::EmbeddedFragment,
                metadata,
            })
        }
    }
}

fn int_attr(obj: &DefaultDicomObject, tag: Tag) -> Option<u32> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u32>().ok())
}

fn float_attr(obj: &DefaultDicomObject, tag: Tag) -> Option<f64> {
    obj.element(tag).ok().and_then(|e| e.to_float64().ok())
}

fn str_attr(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_metadata(obj: &DefaultDicomObject, module: &PixelModule) -> DicomMetadata {
    DicomMetadata {
        patient_id: str_attr(obj, tags::PATIENT_ID),
        patient_name: str_attr(obj, tags::PATIENT_NAME),
        patient_age: str_attr(obj, tags::PATIENT_AGE),
        patient_sex: str_attr(obj, tags::PATIENT_SEX),
        study_date: str_attr(obj, tags::STUDY_DATE),
        study_time: str_attr(obj, tags::STUDY_TIME),
        modality: str_attr(obj, tags::MODALITY),
        institution: str_attr(obj, tags::INSTITUTION_NAME),
        manufacturer: str_attr(obj, tags::MANUFACTURER),
        body_part: str_attr(obj, tags::BODY_PART_EXAMINED),
        view_position: str_attr(obj, tags::VIEW_POSITION),
        image_size: Some(format!("{}x{}", module.rows, module.cols)),
    }
}

fn read_pixel_module(obj: &DefaultDicomObject) -> Result<PixelModule, NormalizeError> {
    let rows = int_attr(obj, tags::ROWS)
        .ok_or_else(|| NormalizeError::CorruptImage("Missing Rows".into()))?;
    let cols = int_attr(obj, tags::COLUMNS)
        .ok_or_else(|| NormalizeError::CorruptImage("Missing Columns".into()))?;

    let window = match (
        float_attr(obj, tags::WINDOW_CENTER),
        float_attr(obj, tags::WINDOW_WIDTH),
    ) {
        (Some(center), Some(width)) if width > 0.0 => Some((center, width)),
        _ => None,
    };

    let photometric = obj
        .element(tags::PHOTOMETRIC_INTERPRETATION)
        .ok()
        .and_then(|e| e.to_str().ok().map(|s| s.trim().to_string()))
        .unwrap_or_default();

    Ok(PixelModule {
        rows,
        cols,
        bits_allocated: int_attr(obj, tags::BITS_ALLOCATED).unwrap_or(16) as u16,
        samples_per_pixel: int_attr(obj, tags::SAMPLES_PER_PIXEL).unwrap_or(1) as u16,
        signed: int_attr(obj, tags::PIXEL_REPRESENTATION).unwrap_or(0) == 1,
        rescale_slope: float_attr(obj, tags::RESCALE_SLOPE).unwrap_or(1.0),
        rescale_intercept: float_attr(obj, tags::RESCALE_INTERCEPT).unwrap_or(0.0),
        window,
        monochrome1: photometric == "MONOCHROME1",
    })
}

fn render_native(module: &PixelModule, raw: &[u8]) -> Result<GrayImage, NormalizeError> {
    let pixel_count = module.rows as usize * module.cols as usize;
    let bytes_per_sample = (module.bits_allocated as usize).div_ceil(8);
    let frame_len = pixel_count * module.samples_per_pixel as usize * bytes_per_sample;
    if raw.len() < frame_len {
        return Err(NormalizeError::CorruptImage(format!(
            "Pixel data holds {} bytes, first frame needs {}",
            raw.len(),
            frame_len
        )));
    }
    let frame = &raw[..frame_len];

    let gray = match (module.samples_per_pixel, module.bits_allocated) {
        (3, 8) => rgb_to_luma(frame),
        (1, 8) | (1, 16) => {
            let samples = decode_samples(frame, module.bits_allocated, module.signed);
            let rescaled: Vec<f64> = samples
                .iter()
                .map(|&v| v * module.rescale_slope + module.rescale_intercept)
                .collect();
            let mut windowed = apply_window(&rescaled, module.window);
            if module.monochrome1 {
                windowed.iter_mut().for_each(|v| *v = 255 - *v);
            }
            windowed
        }
        (samples, bits) => {
            return Err(NormalizeError::CorruptImage(format!(
                "Unsupported pixel layout: {} samples of {} bits",
                samples, bits
            )));
        }
    };

    GrayImage::from_raw(module.cols, module.rows, gray)
        .ok_or_else(|| NormalizeError::CorruptImage("Pixel buffer size mismatch".into()))
}

fn decode_samples(frame: &[u8], bits_allocated: u16, signed: bool) -> Vec<f64> {
    match (bits_allocated, signed) {
        (8, false) => frame.iter().map(|&b| b as f64).collect(),
        (8, true) => frame.iter().map(|&b| b as i8 as f64).collect(),
        (_, false) => frame
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as f64)
            .collect(),
        (_, true) => frame
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f64)
            .collect(),
    }
}

fn rgb_to_luma(frame: &[u8]) -> Vec<u8> {
    frame
        .chunks_exact(3)
        .map(|px| {
            let luma = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            luma.round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Linear VOI window onto 0..=255. Without a window the full value range
/// of the image is used.
pub(crate) fn apply_window(values: &[f64], window: Option<(f64, f64)>) -> Vec<u8> {
    let (low, high) = match window {
        Some((center, width)) => (center - width / 2.0, center + width / 2.0),
        None => {
            let low = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let high = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            (low, high)
        }
    };
    let range = if (high - low).abs() < 1e-6 { 1.0 } else { high - low };

    values
        .iter()
        .map(|&v| {
            if v <= low {
                0
            } else if v >= high {
                255
            } else {
                (((v - low) / range) * 255.0).round() as u8
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_dictionary_std::uids;
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
    use image::Luma;

    /// Explicit VR little endian DX study with a 12-bit horizontal ramp.
    pub(crate) fn dx_study(rows: u16, cols: u16) -> Vec<u8> {
        let pixels: Vec<u8> = (0..rows as u32 * cols as u32)
            .map(|i| ((i % cols as u32) * 4095 / (cols as u32 - 1)) as u16)
            .flat_map(|v| v.to_le_bytes())
            .collect();

        let mut obj = InMemDicomObject::new_empty();
        let elements = [
            (
                tags::SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION),
            ),
            (tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("2.25.1234567890")),
            (tags::PATIENT_ID, VR::LO, PrimitiveValue::from("CXR-0042")),
            (tags::PATIENT_SEX, VR::CS, PrimitiveValue::from("F")),
            (tags::MODALITY, VR::CS, PrimitiveValue::from("DX")),
            (tags::BODY_PART_EXAMINED, VR::CS, PrimitiveValue::from("CHEST")),
            (tags::VIEW_POSITION, VR::CS, PrimitiveValue::from("PA")),
            (tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
            (
                tags::PHOTOMETRIC_INTERPRETATION,
                VR::CS,
                PrimitiveValue::from("MONOCHROME2"),
            ),
            (tags::ROWS, VR::US, PrimitiveValue::from(rows)),
            (tags::COLUMNS, VR::US, PrimitiveValue::from(cols)),
            (tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
            (tags::BITS_STORED, VR::US, PrimitiveValue::from(12_u16)),
            (tags::HIGH_BIT, VR::US, PrimitiveValue::from(11_u16)),
            (tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
            (tags::WINDOW_CENTER, VR::DS, PrimitiveValue::from("2048")),
            (tags::WINDOW_WIDTH, VR::DS, PrimitiveValue::from("4096")),
            (tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(pixels)),
        ];
        for (tag, vr, value) in elements {
            obj.put(DataElement::new(tag, vr, value));
        }

        let file = obj
            .with_meta(FileMetaTableBuilder::new().transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN))
            .unwrap();
        let mut buf = Vec::new();
        file.write_all(&mut buf).unwrap();
        buf
    }

    fn module(rows: u32, cols: u32, bits: u16) -> PixelModule {
        PixelModule {
            rows,
            cols,
            bits_allocated: bits,
            samples_per_pixel: 1,
            signed: false,
            rescale_slope: 1.0,
            rescale_intercept: 0.0,
            window: None,
            monochrome1: false,
        }
    }

    #[test]
    fn explicit_window_clips_both_ends() {
        let out = apply_window(&[-100.0, 0.0, 50.0, 100.0, 400.0], Some((50.0, 100.0)));
        assert_eq!(out, vec![0, 0, 128, 255, 255]);
    }

    #[test]
    fn auto_window_spans_value_range() {
        let out = apply_window(&[1000.0, 1500.0, 2000.0], None);
        assert_eq!(out, vec![0, 128, 255]);
    }

    #[test]
    fn flat_values_do_not_divide_by_zero() {
        let out = apply_window(&[7.0, 7.0], None);
        assert_eq!(out, vec![0, 0]);
    }

    #[test]
    fn renders_sixteen_bit_with_rescale() {
        let mut m = module(1, 3, 16);
        m.rescale_slope = 2.0;
        m.rescale_intercept = -10.0;
        let raw: Vec<u8> = [5u16, 10, 15].iter().flat_map(|v| v.to_le_bytes()).collect();
        let img = render_native(&m, &raw).unwrap();
        assert_eq!(img.dimensions(), (3, 1));
        assert_eq!(img.get_pixel(0, 0), &Luma([0]));
        assert_eq!(img.get_pixel(2, 0), &Luma([255]));
    }

    #[test]
    fn monochrome1_is_inverted() {
        let mut m = module(1, 2, 8);
        m.monochrome1 = true;
        let img = render_native(&m, &[0, 200]).unwrap();
        assert_eq!(img.get_pixel(0, 0), &Luma([255]));
        assert_eq!(img.get_pixel(1, 0), &Luma([0]));
    }

    #[test]
    fn short_pixel_data_is_corrupt() {
        let m = module(4, 4, 16);
        let err = render_native(&m, &[0; 10]).unwrap_err();
        assert!(matches!(err, NormalizeError::CorruptImage(_)));
    }

    #[test]
    fn signed_samples_keep_sign() {
        let raw: Vec<u8> = [-5i16, 5].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(decode_samples(&raw, 16, true), vec![-5.0, 5.0]);
    }

    #[test]
    fn written_study_decodes_natively_with_metadata() {
        let decoded = decode(&dx_study(256, 256)).unwrap();
        assert_eq!(decoded.path, DicomPath::Native);
        assert_eq!(decoded.image.dimensions(), (256, 256));
        assert_eq!(decoded.image.get_pixel(0, 0), &Luma([0]));
        assert_eq!(decoded.image.get_pixel(255, 10), &Luma([255]));

        let meta = decoded.metadata.unwrap();
        assert_eq!(meta.modality.as_deref(), Some("DX"));
        assert_eq!(meta.patient_id.as_deref(), Some("CXR-0042"));
        assert_eq!(meta.view_position.as_deref(), Some("PA"));
        assert_eq!(meta.image_size.as_deref(), Some("256x256"));
        assert_eq!(meta.institution, None);
    }

    #[test]
    fn garbage_is_corrupt() {
        let err = decode(b"definitely not an image").err().unwrap();
        assert!(matches!(err, NormalizeError::CorruptImage(_)));
    }
}
