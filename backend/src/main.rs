use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use cxr_backend::config::AppConfig;
use cxr_backend::gate::DecisionGate;
use cxr_backend::imaging::Normalizer;
use cxr_backend::inference::{EngineHandle, engine_from_config};
use cxr_backend::pipeline::Pipeline;
use cxr_backend::report::{HuggingFaceClient, ReportGenerator, TextGenerator};
use cxr_backend::routes::configure_routes;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| {
        log::error!("Failed to load configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let engine = engine_from_config(&config.engine, &config.labels);
    let engine = Arc::new(EngineHandle::new(
        engine,
        config.labels.clone(),
        config.engine.init_timeout(),
    ));
    if !engine.initialize().await.is_ready() {
        log::warn!("Starting in degraded mode: predictions will not be available");
    }

    let client = HuggingFaceClient::new(&config.report).map_err(|e| {
        log::error!("Failed to build report client: {}", e);
        std::io::Error::other(e.to_string())
    })?;
    if !client.is_configured() {
        log::warn!("No report service token set; reports will use the fallback template");
    }
    let reports = ReportGenerator::new(Arc::new(client), &config.report);

    let pipeline = web::Data::new(Pipeline::new(
        Normalizer::new(&config.imaging),
        engine,
        DecisionGate::from_config(&config.gate, &config.labels),
        reports,
    ));

    let cors_origins = config.server.cors_origins.clone();
    let bind_address = format!("0.0.0.0:{}", config.server.port);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        let cors = cors_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin));
        let cors = if cors_origins.is_empty() {
            cors.allow_any_origin()
        } else {
            cors
        };

        App::new()
            .wrap(
                cors.allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::AUTHORIZATION,
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(pipeline.clone())
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
