use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventHandler};
use crate::metrics::{increment_counter, ALERTS_DISPATCHED, ALERT_FAILURES};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

pub const SIGNATURE_HEADER: &str = "X-Firewatch-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Firewatch-Timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    #[serde(rename = "alert.raised")]
    Raised,
    #[serde(rename = "alert.cleared")]
    Cleared,
}

/// Body of an alert webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub session_id: Option<i32>,
    pub fire: u32,
    pub smoke: u32,
    pub timestamp: DateTime<Utc>,
}

/// HMAC signature generator for webhook authentication
pub struct SignatureGenerator {
    secret: String,
}

impl SignatureGenerator {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// HMAC-SHA256 over `"{timestamp}.{body}"`, hex encoded
    pub fn sign_payload(&self, timestamp: &str, body: &str) -> Result<String, ServiceError> {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        type HmacSha256 = Hmac<Sha256>;

        let signed_payload = format!("{}.{}", timestamp, body);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("Invalid HMAC key: {}", e)))?;
        mac.update(signed_payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Delivers alert payloads to a single endpoint with retries
#[derive(Clone)]
pub struct AlertWebhookClient {
    client: reqwest::Client,
    url: String,
    signature_generator: Option<Arc<SignatureGenerator>>,
    max_retries: u32,
    base_backoff: Duration,
}

impl AlertWebhookClient {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            signature_generator: secret.map(|secret| Arc::new(SignatureGenerator::new(secret))),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        })
    }

    pub fn with_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    /// Send webhook with retry logic
    #[instrument(skip(self, payload), fields(url = %self.url, kind = ?payload.kind))]
    pub async fn send(&self, payload: &AlertPayload) -> Result<(), ServiceError> {
        let body = serde_json::to_string(payload)?;
        let timestamp = payload.timestamp.timestamp().to_string();

        let signature = match &self.signature_generator {
            Some(generator) => Some(generator.sign_payload(&timestamp, &body)?),
            None => None,
        };

        for attempt in 1..=self.max_retries {
            let mut request = self
                .client
                .post(&self.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(TIMESTAMP_HEADER, &timestamp)
                .body(body.clone());

            if let Some(ref sig) = signature {
                request = request.header(SIGNATURE_HEADER, sig);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Alert webhook delivered");
                    return Ok(());
                }
                Ok(response) => {
                    warn!(
                        "Alert webhook failed with status: {} (attempt {}/{})",
                        response.status(),
                        attempt,
                        self.max_retries
                    );
                }
                Err(e) => {
                    warn!(
                        "Alert webhook error: {} (attempt {}/{})",
                        e, attempt, self.max_retries
                    );
                }
            }

            // Exponential backoff: 1x, 2x, 4x
            if attempt < self.max_retries {
                tokio::time::sleep(self.base_backoff * 2_u32.pow(attempt - 1)).await;
            }
        }

        error!("Alert webhook failed after {} attempts", self.max_retries);
        Err(ServiceError::ExternalServiceError(format!(
            "Failed to deliver alert webhook after {} attempts",
            self.max_retries
        )))
    }
}

#[derive(Debug, Default)]
struct AlertState {
    /// A raise was delivered and no clear has followed yet
    raised: bool,
    last_raised_at: Option<Instant>,
}

/// Turns detection changes into raise/clear alerts.
pub struct AlertDispatcher {
    webhook: Option<AlertWebhookClient>,
    cooldown: Duration,
    state: Mutex<AlertState>,
}

impl AlertDispatcher {
    pub fn new(webhook: Option<AlertWebhookClient>, cooldown: Duration) -> Self {
        Self {
            webhook,
            cooldown,
            state: Mutex::new(AlertState::default()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let webhook = config
            .alert_webhook_url
            .as_ref()
            .map(|url| AlertWebhookClient::new(url.clone(), config.alert_webhook_secret.clone()))
            .transpose()?;
        Ok(Self::new(webhook, config.alert_cooldown()))
    }

    /// Decides whether a status change produces an alert and updates the
    /// raise/clear state accordingly.
    pub async fn evaluate(
        &self,
        session_id: Option<i32>,
        fire: u32,
        smoke: u32,
        timestamp: DateTime<Utc>,
    ) -> Option<AlertPayload> {
        let mut state = self.state.lock().await;
        let active = fire > 0 || smoke > 0;

        let kind = if active && !state.raised {
            let cooling_down = state
                .last_raised_at
                .is_some_and(|at| at.elapsed() < self.cooldown);
            if cooling_down {
                info!(fire, smoke, "Alert suppressed during cooldown");
                return None;
            }
            state.raised = true;
            state.last_raised_at = Some(Instant::now());
            AlertKind::Raised
        } else if !active && state.raised {
            state.raised = false;
            AlertKind::Cleared
        } else {
            return None;
        };

        Some(AlertPayload {
            kind,
            session_id,
            fire,
            smoke,
            timestamp,
        })
    }

    async fn dispatch(&self, payload: AlertPayload) -> Result<(), ServiceError> {
        match payload.kind {
            AlertKind::Raised => warn!(
                fire = payload.fire,
                smoke = payload.smoke,
                "Fire alert raised"
            ),
            AlertKind::Cleared => info!("Fire alert cleared"),
        }

        let Some(webhook) = &self.webhook else {
            return Ok(());
        };

        match webhook.send(&payload).await {
            Ok(()) => {
                increment_counter(ALERTS_DISPATCHED);
                Ok(())
            }
            Err(e) => {
                increment_counter(ALERT_FAILURES);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl EventHandler for AlertDispatcher {
    async fn handle_event(&self, event: &Event) -> Result<(), ServiceError> {
        let payload = match event {
            Event::DetectionChanged {
                session_id,
                fire,
                smoke,
                timestamp,
            } => self.evaluate(*session_id, *fire, *smoke, *timestamp).await,
            // Stopping the monitor clears any open alert
            Event::SessionEnded {
                session_id,
                timestamp,
            } => self.evaluate(*session_id, 0, 0, *timestamp).await,
            Event::SessionStarted { .. } => None,
        };

        match payload {
            Some(payload) => self.dispatch(payload).await,
            None => Ok(()),
        }
    }
}
