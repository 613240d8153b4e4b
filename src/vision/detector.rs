use crate::config::AppConfig;
use crate::vision::annotate::encode_jpeg;
use crate::vision::capture::Frame;
use crate::vision::classes::{ClassMap, DetectionClass};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Quality of the JPEG uploaded to the inference service
const UPLOAD_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Detector request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Detector returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error("Invalid detector response: {0}")]
    InvalidResponse(String),
}

/// Box corners in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl From<[f64; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f64; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub class: DetectionClass,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

/// Object detector run against every analysed frame
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    class_id: usize,
    confidence: f64,
    bbox: [f64; 4],
}

/// Posts JPEG frames to an HTTP inference service.
#[derive(Clone)]
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
    confidence_threshold: f64,
    iou_threshold: f64,
    classes: ClassMap,
}

impl HttpDetector {
    pub fn new(
        url: impl Into<String>,
        request_timeout: Duration,
        confidence_threshold: f64,
        iou_threshold: f64,
        classes: ClassMap,
    ) -> Result<Self, DetectorError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            confidence_threshold,
            iou_threshold,
            classes,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, DetectorError> {
        Self::new(
            config.detector_url.clone(),
            config.detector_timeout(),
            config.confidence_threshold,
            config.iou_threshold,
            ClassMap::new(&config.class_names),
        )
    }

    fn interpret(&self, response: DetectResponse) -> Vec<Detection> {
        response
            .detections
            .into_iter()
            .filter(|raw| raw.confidence >= self.confidence_threshold)
            .filter_map(|raw| {
                let class = self.classes.resolve(raw.class_id)?;
                Some(Detection {
                    class_id: raw.class_id,
                    class,
                    confidence: raw.confidence,
                    bbox: raw.bbox.into(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl Detector for HttpDetector {
    #[instrument(skip_all, fields(url = %self.url))]
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let body = encode_jpeg(&frame.image, UPLOAD_JPEG_QUALITY)?;

        let response = self
            .client
            .post(&self.url)
            .query(&[
                ("conf", self.confidence_threshold),
                ("iou", self.iou_threshold),
            ])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectorError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let parsed: DetectResponse = serde_json::from_slice(&bytes)
            .map_err(|e| DetectorError::InvalidResponse(e.to_string()))?;

        let detections = self.interpret(parsed);
        debug!(count = detections.len(), "Frame analysed");
        Ok(detections)
    }
}
