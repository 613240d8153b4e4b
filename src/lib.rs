//! Firewatch
//!
//! Watches an RTSP camera for fire and smoke, streams an annotated preview,
//! pushes live detection updates and records monitoring sessions for reporting.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod middleware_helpers;
pub mod migrator;
pub mod monitor;
pub mod services;
pub mod tracing;
pub mod vision;
pub mod webhooks;

use axum::{
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer};

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::health::HealthState;
use crate::monitor::Monitor;
use crate::services::DetectionStore;

/// State shared by every HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub store: DetectionStore,
    pub monitor: Arc<Monitor>,
}

/// CORS from configuration: explicit origins, or permissive where allowed.
pub fn cors_layer(cfg: &AppConfig) -> Result<CorsLayer, ServiceError> {
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    if let Some(origins) = configured_origins {
        Ok(CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any))
    } else if cfg.should_allow_permissive_cors() {
        ::tracing::info!(
            "Using permissive CORS because explicit origins were not configured ({})",
            if cfg.is_development() {
                "development environment"
            } else {
                "explicit override enabled"
            }
        );
        Ok(CorsLayer::permissive())
    } else {
        Err(ServiceError::InvalidInput(
            "Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true"
                .to_string(),
        ))
    }
}

fn api_routes() -> Router<AppState> {
    use handlers::reports;

    Router::new()
        .route("/statistics", get(reports::statistics))
        .route("/sessions", get(reports::sessions))
        .route("/session/:session_id", get(reports::session_logs))
        .route("/reports/date-range", get(reports::date_range))
        .route("/detections", get(reports::detections))
        .route("/maintenance/prune", post(reports::prune))
        // JSON only; the live streams stay uncompressed
        .layer(CompressionLayer::new())
}

fn metrics_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/metrics",
            get(|| async move {
                match metrics::metrics_handler().await {
                    Ok(body) => (StatusCode::OK, body),
                    Err(_) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        String::from("metrics error"),
                    ),
                }
            }),
        )
        .route(
            "/metrics/json",
            get(|| async move { Json(metrics::metrics_json_handler().await) }),
        )
}

/// Builds the full HTTP router with tracing, CORS and request ids applied.
pub fn build_router(state: AppState, health: Arc<HealthState>) -> Result<Router, ServiceError> {
    use handlers::{monitor as live, pages};

    let cors = cors_layer(&state.config)?;

    let app = Router::new()
        .route("/", get(pages::index))
        .route("/reports", get(pages::reports))
        .route("/video", get(live::video_feed))
        .route("/detections", get(live::detection_events))
        .route("/detection_status", get(live::detection_status))
        .route(
            "/start",
            get(live::start_monitoring).post(live::start_monitoring),
        )
        .route("/stop", get(live::stop_monitoring).post(live::stop_monitoring))
        .merge(metrics_routes())
        .nest("/api", api_routes())
        .with_state(state)
        .nest("/health", health::health_routes(health))
        .layer(crate::tracing::configure_http_tracing())
        .layer(cors)
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ));

    Ok(app)
}
