use actix_multipart::Multipart;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError, web};
use cxr_shared::PatientContext;
use futures_util::TryStreamExt;
use lazy_static::lazy_static;
use log::{error, info, warn};
use regex::Regex;
use serde::Serialize;
use serde_json::json;

use crate::imaging::{ImageFormat, NormalizeError, RawImage};
use crate::inference::{EngineStatus, InferenceError};
use crate::pipeline::{Pipeline, PipelineError};

const MAX_AGE: u8 = 120;
const MAX_SYMPTOMS_CHARS: usize = 500;
const MAX_HISTORY_CHARS: usize = 1000;

lazy_static! {
    static ref SEX_PATTERN: Regex = Regex::new(r"^(M|F|Male|Female|Masculino|Femenino)$").unwrap();
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::Pipeline(e) => e.kind(),
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl From<NormalizeError> for ApiError {
    fn from(e: NormalizeError) -> Self {
        ApiError::Pipeline(e.into())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(PipelineError::Input(NormalizeError::UnsupportedFormat(_))) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ApiError::Pipeline(PipelineError::Input(_)) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(PipelineError::Engine(InferenceError::InferenceTimeout(_))) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ApiError::Pipeline(PipelineError::Engine(InferenceError::MalformedEngineOutput(_))) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Pipeline(PipelineError::Engine(InferenceError::EngineUnavailable(_))) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Pipeline(PipelineError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }
        HttpResponse::build(status).json(ErrorResponse {
            error: self.to_string(),
            kind: self.kind(),
        })
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(
            web::scope("/api/v1")
                .service(web::resource("/detect").route(web::post().to(detect)))
                .service(web::resource("/validate-image").route(web::post().to(validate_image)))
                .service(web::resource("/supported-formats").route(web::get().to(supported_formats)))
                .service(web::resource("/info").route(web::get().to(service_info))),
        );
}

struct Upload {
    bytes: Vec<u8>,
    filename: String,
    content_type: Option<String>,
}

impl Upload {
    fn into_raw(self) -> Result<RawImage, ApiError> {
        Ok(RawImage::from_upload(
            self.bytes,
            &self.filename,
            self.content_type.as_deref(),
        )?)
    }
}

#[derive(Default)]
struct DetectForm {
    file: Option<Upload>,
    patient: Option<PatientContext>,
}

async fn read_form(mut payload: Multipart, max_bytes: usize) -> Result<DetectForm, ApiError> {
    let mut form = DetectForm::default();

    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let content_type = field.content_type().map(|m| m.essence_str().to_string());

        let mut data = Vec::new();
        while let Some(chunk) = field
            .try_next()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {}", e)))?
        {
            if data.len() + chunk.len() > max_bytes {
                return Err(NormalizeError::PayloadTooLarge {
                    size: data.len() + chunk.len(),
                    limit: max_bytes,
                }
                .into());
            }
            data.extend_from_slice(&chunk);
        }

        match name.as_str() {
            "file" => {
                form.file = Some(Upload {
                    bytes: data,
                    filename: filename.unwrap_or_default(),
                    content_type,
                })
            }
            "patient_info" => form.patient = Some(parse_patient(&data)?),
            other => log::debug!("Ignoring multipart field '{}'", other),
        }
    }
    Ok(form)
}

fn parse_patient(data: &[u8]) -> Result<PatientContext, ApiError> {
    let patient: PatientContext = serde_json::from_slice(data)
        .map_err(|e| ApiError::BadRequest(format!("Invalid patient_info JSON: {}", e)))?;
    if patient.age.is_some_and(|age| age > MAX_AGE) {
        return Err(ApiError::BadRequest(format!("Age must be between 0 and {}", MAX_AGE)));
    }
    if let Some(sex) = patient.sex.as_deref() {
        if !SEX_PATTERN.is_match(sex) {
            return Err(ApiError::BadRequest(format!(
                "Sex must be one of M, F, Male, Female, Masculino, Femenino (got '{}')",
                sex
            )));
        }
    }
    check_length("Symptoms", patient.symptoms.as_deref(), MAX_SYMPTOMS_CHARS)?;
    check_length(
        "Clinical history",
        patient.clinical_history.as_deref(),
        MAX_HISTORY_CHARS,
    )?;
    Ok(patient)
}

fn check_length(field: &str, value: Option<&str>, max_chars: usize) -> Result<(), ApiError> {
    if value.is_some_and(|v| v.chars().count() > max_chars) {
        return Err(ApiError::BadRequest(format!(
            "{} must not exceed {} characters",
            field, max_chars
        )));
    }
    Ok(())
}

async fn detect(pipeline: web::Data<Pipeline>, payload: Multipart) -> Result<HttpResponse, ApiError> {
    let form = read_form(payload, pipeline.normalizer().max_bytes()).await?;
    let upload = form
        .file
        .ok_or_else(|| ApiError::BadRequest("Missing 'file' field".into()))?;
    let raw = upload.into_raw()?;

    let record = pipeline
        .analyze(raw, &form.patient.unwrap_or_default())
        .await?;
    info!(
        "[{}] Completed: {}",
        record.request_id,
        record.trail.last().map(ToString::to_string).unwrap_or_default()
    );
    Ok(HttpResponse::Ok().json(record.into_response()))
}

async fn validate_image(
    pipeline: web::Data<Pipeline>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let form = read_form(payload, pipeline.normalizer().max_bytes()).await?;
    let upload = form
        .file
        .ok_or_else(|| ApiError::BadRequest("Missing 'file' field".into()))?;
    let filename = upload.filename.clone();
    let raw = match upload.into_raw() {
        Ok(raw) => raw,
        Err(e) => return Ok(invalid(&filename, &e)),
    };
    let sha256 = raw.sha256();

    let normalizer = pipeline.normalizer().clone();
    let inspection = web::block(move || normalizer.inspect(&raw))
        .await
        .map_err(|e| ApiError::Pipeline(PipelineError::Internal(e.to_string())))?;

    match inspection {
        Ok(inspection) => Ok(HttpResponse::Ok().json(json!({
            "valid": true,
            "filename": filename,
            "sha256": sha256,
            "format": inspection.format,
            "width": inspection.width,
            "height": inspection.height,
            "warnings": inspection.warnings,
            "dicom_metadata": inspection.dicom_metadata,
        }))),
        Err(e) => Ok(invalid(&filename, &ApiError::from(e))),
    }
}

fn invalid(filename: &str, e: &ApiError) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "valid": false,
        "filename": filename,
        "error": e.to_string(),
        "kind": e.kind(),
    }))
}

async fn supported_formats(pipeline: web::Data<Pipeline>) -> HttpResponse {
    let formats: Vec<_> = ImageFormat::ALL
        .iter()
        .map(|format| {
            json!({
                "format": format.to_string(),
                "extensions": format.extensions(),
                "mime_type": format.mime_type(),
                "medical": format.is_medical(),
            })
        })
        .collect();
    let normalizer = pipeline.normalizer();
    HttpResponse::Ok().json(json!({
        "formats": formats,
        "max_bytes": normalizer.max_bytes(),
        "min_edge": normalizer.min_edge(),
        "target_size": normalizer.target_size(),
    }))
}

fn engine_json(status: Option<&EngineStatus>) -> serde_json::Value {
    match status {
        Some(EngineStatus::Ready(info)) => json!({ "status": "ready", "info": info }),
        Some(EngineStatus::Unavailable(reason)) => json!({ "status": "unavailable", "reason": reason }),
        None => json!({ "status": "initializing" }),
    }
}

async fn service_info(pipeline: web::Data<Pipeline>) -> HttpResponse {
    let labels = pipeline.engine().labels();
    let reports = pipeline.reports();
    HttpResponse::Ok().json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "engine": engine_json(pipeline.engine().status()),
        "labels": { "positive": labels.positive, "negative": labels.negative },
        "threshold": pipeline.gate().threshold(),
        "report": {
            "model": reports.model_id(),
            "configured": reports.is_configured(),
            "language": reports.language().as_str(),
        },
    }))
}

async fn health(pipeline: web::Data<Pipeline>) -> HttpResponse {
    let engine_ready = pipeline.engine().status().is_some_and(EngineStatus::is_ready);
    let reports_configured = pipeline.reports().is_configured();
    let status = if engine_ready && reports_configured {
        "healthy"
    } else {
        "degraded"
    };
    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now(),
        "services": {
            "inference": engine_json(pipeline.engine().status()),
            "report_generation": if reports_configured { "configured" } else { "fallback_only" },
        },
    }))
}
