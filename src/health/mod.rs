/*!
 * # Health Check Module
 *
 * Liveness and readiness endpoints for the monitoring service:
 *
 * - Basic health check (`/health`) - Simple up/down status
 * - Readiness check (`/health/ready`) - Pings the database before answering
 * - Liveness check (`/health/live`) - Process uptime
 */

use crate::monitor::Monitor;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

const CAPTURE_STALE_SECS: i64 = 30;

/// Basic health status
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
    Degraded,
}

/// Health check detail
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthDetail {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Overall health information
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthInfo {
    pub status: HealthStatus,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub details: HashMap<String, HealthDetail>,
}

/// Health check state
#[derive(Clone)]
pub struct HealthState {
    pub db_pool: Arc<DatabaseConnection>,
    pub monitor: Arc<Monitor>,
    pub health_cache: Arc<RwLock<HealthInfo>>,
    pub start_time: SystemTime,
}

impl HealthState {
    pub fn new(db_pool: Arc<DatabaseConnection>, monitor: Arc<Monitor>) -> Self {
        Self {
            db_pool,
            monitor,
            health_cache: Arc::new(RwLock::new(HealthInfo {
                status: HealthStatus::Up,
                version: env!("CARGO_PKG_VERSION").to_string(),
                timestamp: Utc::now(),
                uptime_seconds: 0,
                details: HashMap::new(),
            })),
            start_time: SystemTime::now(),
        }
    }

    /// Calculate system uptime
    pub fn uptime(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.start_time)
            .unwrap_or(Duration::from_secs(0))
            .as_secs()
    }

    /// Update health status
    pub async fn update_health(&self) {
        let database = HealthDetail {
            status: match self.db_pool.ping().await {
                Ok(_) => HealthStatus::Up,
                Err(e) => {
                    error!("Database health check failed: {}", e);
                    HealthStatus::Down
                }
            },
            message: None,
            timestamp: Utc::now(),
        };

        let capture = self.capture_detail().await;

        let mut health = self.health_cache.write().await;
        health.timestamp = Utc::now();
        health.uptime_seconds = self.uptime();
        health.details.insert("database".to_string(), database);
        health.details.insert("capture".to_string(), capture);

        let any_down = health
            .details
            .values()
            .any(|detail| detail.status == HealthStatus::Down);
        let any_degraded = health
            .details
            .values()
            .any(|detail| detail.status == HealthStatus::Degraded);

        health.status = if any_down {
            HealthStatus::Down
        } else if any_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Up
        };
    }

    /// An idle monitor is healthy. While capturing, frames that stop reaching
    /// the detector degrade the service without taking it down.
    async fn capture_detail(&self) -> HealthDetail {
        let (status, message) = if !self.monitor.is_capturing() {
            (HealthStatus::Up, "idle".to_string())
        } else {
            match self.monitor.last_analyzed_at().await {
                Some(at) if Utc::now() - at <= stale_after() => {
                    (HealthStatus::Up, "capturing".to_string())
                }
                Some(at) => (
                    HealthStatus::Degraded,
                    format!("no frame analysed since {}", at.to_rfc3339()),
                ),
                None => (HealthStatus::Degraded, "waiting for first frame".to_string()),
            }
        };

        HealthDetail {
            status,
            message: Some(message),
            timestamp: Utc::now(),
        }
    }
}

fn stale_after() -> chrono::Duration {
    chrono::Duration::seconds(CAPTURE_STALE_SECS)
}

fn status_code_for(status: &HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Up | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Basic health check endpoint
pub async fn health_check(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    debug!("Health check endpoint called");

    let health = state.health_cache.read().await;

    (
        status_code_for(&health.status),
        Json(json!({
            "status": health.status,
            "version": health.version,
            "timestamp": health.timestamp,
        })),
    )
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    debug!("Readiness check endpoint called");

    state.update_health().await;
    let health = state.health_cache.read().await;

    (
        status_code_for(&health.status),
        Json(json!({
            "ready": health.status == HealthStatus::Up,
            "details": health.details,
            "timestamp": health.timestamp,
        })),
    )
}

/// Liveness check endpoint
pub async fn liveness_check(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "alive": true,
            "uptime_seconds": state.uptime(),
            "timestamp": Utc::now(),
        })),
    )
}

/// Run periodic health checks
pub async fn run_health_checker(state: Arc<HealthState>, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;
        state.update_health().await;

        let health = state.health_cache.read().await;
        if health.status != HealthStatus::Up {
            warn!("System health is not optimal: {:?}", health.status);

            for (name, detail) in &health.details {
                if detail.status != HealthStatus::Up {
                    warn!("Component {name} is not healthy: {:?}", detail.status);
                }
            }
        }
    }
}

/// Health endpoints, to be nested under `/health`
pub fn health_routes(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/live", get(liveness_check))
        .with_state(state)
}
