#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use firewatch::{
    build_router,
    config::AppConfig,
    db::{self, DbConfig},
    events::{self, EventHandler},
    health::HealthState,
    monitor::{Monitor, MonitorSettings},
    services::DetectionStore,
    vision::{BoundingBox, Detection, DetectionClass, Detector, DetectorError, Frame, FrameQueue},
    webhooks::{AlertDispatcher, AlertWebhookClient},
    AppState,
};
use image::RgbImage;
use serde_json::Value;
use tower::ServiceExt;

/// Detector whose next answer is set by the test
#[derive(Clone)]
pub struct FakeDetector {
    next: Arc<Mutex<Result<Vec<Detection>, String>>>,
}

impl FakeDetector {
    pub fn respond_with(&self, detections: Vec<Detection>) {
        *self.next.lock().unwrap() = Ok(detections);
    }

    pub fn fail_with(&self, message: &str) {
        *self.next.lock().unwrap() = Err(message.to_string());
    }
}

impl Default for FakeDetector {
    fn default() -> Self {
        Self {
            next: Arc::new(Mutex::new(Ok(Vec::new()))),
        }
    }
}

#[async_trait]
impl Detector for FakeDetector {
    async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        self.next
            .lock()
            .unwrap()
            .clone()
            .map_err(DetectorError::InvalidResponse)
    }
}

pub fn detection(class: DetectionClass, confidence: f64) -> Detection {
    Detection {
        class_id: 0,
        class,
        confidence,
        bbox: BoundingBox::from([2.0, 2.0, 12.0, 12.0]),
    }
}

pub fn blank_frame() -> Frame {
    Frame::new(RgbImage::new(16, 16))
}

/// Helper harness backed by an in-memory SQLite database and a fake detector.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub detector: FakeDetector,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Construct a test application after letting the caller adjust the config.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "rtsp://camera.invalid/stream".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.cors_allow_any_origin = true;
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        adjust(&mut cfg);

        let pool = db::establish_connection_with_config(&DbConfig::from(&cfg))
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);
        let store = DetectionStore::new(db.clone());

        let webhook = cfg.alert_webhook_url.as_ref().map(|url| {
            AlertWebhookClient::new(url.clone(), cfg.alert_webhook_secret.clone())
                .expect("webhook client")
                .with_backoff(Duration::from_millis(10))
        });
        let dispatcher = AlertDispatcher::new(webhook, cfg.alert_cooldown());
        let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(dispatcher)];
        let (event_sender, event_rx) = events::channel(64);
        let event_task = tokio::spawn(events::process_events(event_rx, handlers));

        let detector = FakeDetector::default();
        let monitor = Arc::new(Monitor::new(
            store.clone(),
            Arc::new(detector.clone()),
            Arc::new(FrameQueue::new(cfg.frame_queue_capacity)),
            event_sender,
            MonitorSettings::from(&cfg),
        ));

        let health = Arc::new(HealthState::new(db.clone(), monitor.clone()));
        let state = AppState {
            db,
            config: Arc::new(cfg),
            store,
            monitor,
        };
        let router = build_router(state.clone(), health).expect("router");

        Self {
            router,
            state,
            detector,
            _event_task: event_task,
        }
    }

    pub fn store(&self) -> &DetectionStore {
        &self.state.store
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.state.monitor
    }

    /// Runs one blank frame through the pipeline with the given detections.
    pub async fn analyse(&self, detections: Vec<Detection>) {
        self.detector.respond_with(detections);
        self.monitor()
            .process_frame(blank_frame())
            .await
            .expect("frame processed");
    }

    pub async fn request(&self, method: Method, uri: &str) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router response")
    }

    pub async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let response = self.request(Method::GET, uri).await;
        let status = response.status();
        (status, body_json(response).await)
    }
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("parse response body")
}

pub async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}
