use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info, warn};

use crate::errors::ServiceError;
use crate::metrics::{increment_counter, EVENTS_DROPPED};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Queues an event without waiting. A full queue drops the event so a
    /// slow consumer never holds up capture or session transitions.
    pub fn publish(&self, event: Event) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                increment_counter(EVENTS_DROPPED);
                warn!("Event queue full, dropping {:?}", event);
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Event queue closed");
                false
            }
        }
    }
}

/// Creates a bounded event channel
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender::new(tx), rx)
}

/// Things that happen in the monitoring pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SessionStarted {
        session_id: i32,
        timestamp: DateTime<Utc>,
    },
    SessionEnded {
        session_id: Option<i32>,
        timestamp: DateTime<Utc>,
    },
    DetectionChanged {
        session_id: Option<i32>,
        fire: u32,
        smoke: u32,
        timestamp: DateTime<Utc>,
    },
}

// Handlers registered with `process_events` see every event in order.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), ServiceError>;
}

/// Logs incoming events and fans them out to the registered handlers.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::SessionStarted { session_id, .. } => {
                info!(session_id, "Monitoring session started");
            }
            Event::SessionEnded { session_id, .. } => {
                info!(session_id = ?session_id, "Monitoring session ended");
            }
            Event::DetectionChanged {
                session_id,
                fire,
                smoke,
                ..
            } => {
                if *fire > 0 || *smoke > 0 {
                    warn!(session_id = ?session_id, fire, smoke, "Fire or smoke detected");
                } else {
                    info!(session_id = ?session_id, "Detections cleared");
                }
            }
        }

        for handler in &handlers {
            if let Err(e) = handler.handle_event(&event).await {
                error!("Failed to handle event {:?}: {}", event, e);
            }
        }
    }

    warn!("Event processing loop has ended");
}
