use super::Monitor;
use crate::metrics::{increment_counter, DETECTOR_ERRORS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const FRAME_WAIT: Duration = Duration::from_secs(1);

/// Detection worker. Analyses queued frames while monitoring is active; a
/// single worker serves every connected viewer.
pub async fn run_detection(monitor: Arc<Monitor>) {
    let mut capturing = monitor.capture_state();
    info!("Detection worker started");

    loop {
        while !*capturing.borrow_and_update() {
            if capturing.changed().await.is_err() {
                info!("Detection worker stopped");
                return;
            }
        }

        let Some(frame) = monitor.queue().pop(FRAME_WAIT).await else {
            continue;
        };
        if !monitor.is_capturing() {
            continue;
        }

        if let Err(e) = monitor.process_frame(frame).await {
            increment_counter(DETECTOR_ERRORS);
            warn!("Skipping frame, detection failed: {}", e);
        }
    }
}
