//! Live monitoring state shared by the HTTP layer and the workers.

mod pipeline;

pub use pipeline::run_detection;

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::metrics::{
    increment_counter, set_gauge, ACTIVE_SESSION, CURRENT_FIRE, CURRENT_SMOKE, DETECTION_CHANGES,
    FRAMES_ANALYZED,
};
use crate::services::detection_store::{DetectionStore, SessionSummary};
use crate::vision::{
    annotate, annotate::max_confidence, count, encode_jpeg, Detection, DetectionClass,
    DetectionCounts, Detector, DetectorError, Frame, FrameQueue,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Latest fire/smoke counts and when they last changed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionStatus {
    pub fire: u32,
    pub smoke: u32,
    /// Unix seconds
    pub timestamp: f64,
}

impl DetectionStatus {
    pub fn cleared() -> Self {
        Self {
            fire: 0,
            smoke: 0,
            timestamp: unix_now(),
        }
    }

    pub fn counts(&self) -> DetectionCounts {
        DetectionCounts {
            fire: self.fire,
            smoke: self.smoke,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub jpeg_quality: u8,
    pub detection_channel_capacity: usize,
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            detection_channel_capacity: 10,
            snapshot_dir: None,
        }
    }
}

impl From<&AppConfig> for MonitorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            jpeg_quality: config.jpeg_quality,
            detection_channel_capacity: config.detection_channel_capacity,
            snapshot_dir: config.snapshot_dir.clone(),
        }
    }
}

/// Status plus the session it belongs to. `generation` moves on every start
/// and stop, so a frame analysed across a transition can be recognised.
#[derive(Debug)]
struct LiveState {
    status: DetectionStatus,
    session_id: Option<i32>,
    generation: u64,
}

pub struct Monitor {
    store: DetectionStore,
    detector: Arc<dyn Detector>,
    queue: Arc<FrameQueue>,
    events: EventSender,
    settings: MonitorSettings,
    capturing: watch::Sender<bool>,
    /// Guards session transitions so start/stop never interleave
    session: Mutex<Option<i32>>,
    live: RwLock<LiveState>,
    updates: broadcast::Sender<DetectionStatus>,
    frames: watch::Sender<Option<Bytes>>,
    analyzed_at: RwLock<Option<DateTime<Utc>>>,
}

impl Monitor {
    pub fn new(
        store: DetectionStore,
        detector: Arc<dyn Detector>,
        queue: Arc<FrameQueue>,
        events: EventSender,
        settings: MonitorSettings,
    ) -> Self {
        let (capturing, _) = watch::channel(false);
        let (updates, _) = broadcast::channel(settings.detection_channel_capacity.max(1));
        let (frames, _) = watch::channel(None);
        Self {
            store,
            detector,
            queue,
            events,
            settings,
            capturing,
            session: Mutex::new(None),
            live: RwLock::new(LiveState {
                status: DetectionStatus::cleared(),
                session_id: None,
                generation: 0,
            }),
            updates,
            frames,
            analyzed_at: RwLock::new(None),
        }
    }

    /// Starts a monitoring session, ending a still-active one first.
    pub async fn start(&self) -> Result<i32, ServiceError> {
        let mut session = self.session.lock().await;

        if let Some(previous) = session.take() {
            info!(session_id = previous, "Ending active session before restart");
            if let Err(e) = self.store.end_session(previous).await {
                warn!(session_id = previous, "Failed to end previous session: {}", e);
            }
        }

        let session_id = match self.store.start_session().await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to open monitoring session: {}", e);
                self.capturing.send_replace(false);
                self.reset(None).await;
                set_gauge(ACTIVE_SESSION, 0.0);
                return Err(ServiceError::ServiceUnavailable(
                    "could not open a monitoring session".to_string(),
                ));
            }
        };
        *session = Some(session_id);

        self.reset(Some(session_id)).await;
        *self.analyzed_at.write().await = None;
        self.queue.clear().await;
        self.capturing.send_replace(true);
        set_gauge(ACTIVE_SESSION, 1.0);

        self.events.publish(Event::SessionStarted {
            session_id,
            timestamp: Utc::now(),
        });

        Ok(session_id)
    }

    /// Stops capturing and completes the active session. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<Option<SessionSummary>, ServiceError> {
        let mut session = self.session.lock().await;

        self.capturing.send_replace(false);
        self.reset(None).await;
        set_gauge(ACTIVE_SESSION, 0.0);

        let Some(session_id) = session.take() else {
            return Ok(None);
        };

        self.events.publish(Event::SessionEnded {
            session_id: Some(session_id),
            timestamp: Utc::now(),
        });

        self.store.end_session(session_id).await.map(Some)
    }

    /// When the detector last answered for a frame
    pub async fn last_analyzed_at(&self) -> Option<DateTime<Utc>> {
        *self.analyzed_at.read().await
    }

    pub fn is_capturing(&self) -> bool {
        *self.capturing.borrow()
    }

    /// Receiver for the capturing flag, used by the capture and detection workers
    pub fn capture_state(&self) -> watch::Receiver<bool> {
        self.capturing.subscribe()
    }

    pub async fn current_session(&self) -> Option<i32> {
        *self.session.lock().await
    }

    pub async fn status(&self) -> DetectionStatus {
        self.live.read().await.status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionStatus> {
        self.updates.subscribe()
    }

    pub fn latest_frame(&self) -> watch::Receiver<Option<Bytes>> {
        self.frames.subscribe()
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    /// Runs one frame through detection. Returns the new status when the
    /// fire/smoke counts changed. A frame whose analysis overlaps a start or
    /// stop is discarded.
    pub async fn process_frame(
        &self,
        mut frame: Frame,
    ) -> Result<Option<DetectionStatus>, DetectorError> {
        let generation = self.live.read().await.generation;

        let detections = self.detector.detect(&frame).await?;
        increment_counter(FRAMES_ANALYZED);

        let counts = count(&detections);
        annotate(&mut frame.image, &detections);
        let jpeg = match encode_jpeg(&frame.image, self.settings.jpeg_quality) {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                error!("Failed to encode annotated frame: {}", e);
                None
            }
        };

        // Held until the change is recorded so start/stop cannot interleave
        let mut live = self.live.write().await;
        if live.generation != generation {
            debug!("Discarding frame analysed across a session change");
            return Ok(None);
        }

        *self.analyzed_at.write().await = Some(Utc::now());
        if let Some(jpeg) = &jpeg {
            self.frames.send_replace(Some(jpeg.clone()));
        }

        if live.status.counts() == counts {
            return Ok(None);
        }
        live.status = DetectionStatus {
            fire: counts.fire,
            smoke: counts.smoke,
            timestamp: unix_now(),
        };
        let status = live.status;
        let session_id = live.session_id;

        increment_counter(DETECTION_CHANGES);
        set_gauge(CURRENT_FIRE, counts.fire as f64);
        set_gauge(CURRENT_SMOKE, counts.smoke as f64);

        // No subscribers is fine
        let _ = self.updates.send(status);

        self.events.publish(Event::DetectionChanged {
            session_id,
            fire: counts.fire,
            smoke: counts.smoke,
            timestamp: Utc::now(),
        });

        if let Some(session_id) = session_id {
            self.record_change(session_id, counts, &detections, jpeg.as_ref())
                .await;
        }

        Ok(Some(status))
    }

    async fn record_change(
        &self,
        session_id: i32,
        counts: DetectionCounts,
        detections: &[Detection],
        jpeg: Option<&Bytes>,
    ) {
        let alert_triggered = !counts.is_clear();
        if let Err(e) = self
            .store
            .add_detection_log(session_id, counts.fire, counts.smoke, alert_triggered)
            .await
        {
            error!(session_id, "Failed to write detection log: {}", e);
        }

        if !alert_triggered {
            return;
        }

        let image_path = match (jpeg, &self.settings.snapshot_dir) {
            (Some(jpeg), Some(dir)) => self.save_snapshot(dir, session_id, jpeg).await,
            _ => None,
        };

        for (class, n) in [
            (DetectionClass::Fire, counts.fire),
            (DetectionClass::Smoke, counts.smoke),
        ] {
            if n == 0 {
                continue;
            }
            let confidence = max_confidence(detections, class);
            if let Err(e) = self
                .store
                .add_detection(class.as_ref(), n, confidence, image_path.clone())
                .await
            {
                error!(session_id, "Failed to write {} detection: {}", class, e);
            }
        }
    }

    async fn save_snapshot(&self, dir: &Path, session_id: i32, jpeg: &Bytes) -> Option<String> {
        let path = dir.join(format!(
            "session-{}-{}.jpg",
            session_id,
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        let result = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, jpeg).await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(path = %path.display(), "Snapshot saved");
                Some(path.to_string_lossy().into_owned())
            }
            Err(e) => {
                error!(path = %path.display(), "Failed to save snapshot: {}", e);
                None
            }
        }
    }

    /// Clears the status and binds it to `session_id`, invalidating frames
    /// still in flight.
    async fn reset(&self, session_id: Option<i32>) {
        let cleared = DetectionStatus::cleared();
        let mut live = self.live.write().await;
        live.status = cleared;
        live.session_id = session_id;
        live.generation += 1;
        set_gauge(CURRENT_FIRE, 0.0);
        set_gauge(CURRENT_SMOKE, 0.0);
        let _ = self.updates.send(cleared);
    }
}

fn unix_now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use crate::vision::BoundingBox;
    use async_trait::async_trait;
    use image::RgbImage;
    use sea_orm::ConnectionTrait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Returns the scripted detections in order, repeating the last entry
    struct ScriptedDetector {
        script: std::sync::Mutex<Vec<Vec<Detection>>>,
    }

    impl ScriptedDetector {
        fn new(mut script: Vec<Vec<Detection>>) -> Self {
            script.reverse();
            Self {
                script: std::sync::Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl Detector for ScriptedDetector {
        async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                Ok(script.pop().unwrap())
            } else {
                Ok(script.last().cloned().unwrap_or_default())
            }
        }
    }

    fn fire(confidence: f64) -> Detection {
        Detection {
            class_id: 0,
            class: DetectionClass::Fire,
            confidence,
            bbox: BoundingBox::from([1.0, 1.0, 6.0, 6.0]),
        }
    }

    /// Sleeps before reporting a single fire
    struct SlowDetector {
        delay: Duration,
    }

    #[async_trait]
    impl Detector for SlowDetector {
        async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![fire(0.9)])
        }
    }

    async fn build(
        detector: Arc<dyn Detector>,
        snapshot_dir: Option<PathBuf>,
        event_capacity: usize,
    ) -> (Monitor, mpsc::Receiver<Event>) {
        let pool = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&pool).await.unwrap();
        let (events, rx) = crate::events::channel(event_capacity);
        let monitor = Monitor::new(
            DetectionStore::new(Arc::new(pool)),
            detector,
            Arc::new(FrameQueue::new(2)),
            events,
            MonitorSettings {
                snapshot_dir,
                ..Default::default()
            },
        );
        (monitor, rx)
    }

    async fn monitor(
        script: Vec<Vec<Detection>>,
        snapshot_dir: Option<PathBuf>,
    ) -> (Monitor, mpsc::Receiver<Event>) {
        build(Arc::new(ScriptedDetector::new(script)), snapshot_dir, 32).await
    }

    async fn slow_monitor() -> (Arc<Monitor>, mpsc::Receiver<Event>) {
        let detector = SlowDetector {
            delay: Duration::from_millis(200),
        };
        let (monitor, rx) = build(Arc::new(detector), None, 32).await;
        (Arc::new(monitor), rx)
    }

    fn frame() -> Frame {
        Frame::new(RgbImage::new(8, 8))
    }

    #[tokio::test]
    async fn changes_are_logged_broadcast_and_published() {
        let (monitor, mut events) = monitor(vec![vec![fire(0.8), fire(0.9)], vec![]], None).await;
        let session_id = monitor.start().await.unwrap();
        assert!(monitor.is_capturing());
        let mut updates = monitor.subscribe();
        let frames = monitor.latest_frame();

        let changed = monitor.process_frame(frame()).await.unwrap().unwrap();
        assert_eq!((changed.fire, changed.smoke), (2, 0));
        assert_eq!(updates.recv().await.unwrap().fire, 2);
        assert!(frames.borrow().is_some());

        let cleared = monitor.process_frame(frame()).await.unwrap().unwrap();
        assert_eq!(cleared.fire, 0);
        // unchanged counts are not reported again
        assert!(monitor.process_frame(frame()).await.unwrap().is_none());

        let logs = monitor.store.get_session_logs(session_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].alert_triggered);
        assert!(!logs[1].alert_triggered);

        let detections = monitor.store.get_all_detections(10).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].detection_type, "fire");
        assert_eq!(detections[0].confidence, Some(0.9));

        assert!(matches!(
            events.recv().await.unwrap(),
            Event::SessionStarted { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::DetectionChanged { fire: 2, .. }
        ));
    }

    #[tokio::test]
    async fn stop_completes_session_and_is_idempotent() {
        let (monitor, _events) = monitor(vec![vec![fire(0.7)]], None).await;
        let session_id = monitor.start().await.unwrap();
        monitor.process_frame(frame()).await.unwrap();

        let summary = monitor.stop().await.unwrap().unwrap();
        assert_eq!(summary.id, session_id);
        assert_eq!(summary.total_fire, 1);
        assert_eq!(summary.status, "completed");
        assert!(!monitor.is_capturing());
        assert_eq!(monitor.status().await.fire, 0);

        assert!(monitor.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restart_ends_the_previous_session() {
        let (monitor, _events) = monitor(vec![vec![]], None).await;
        let first = monitor.start().await.unwrap();
        let second = monitor.start().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(monitor.current_session().await, Some(second));

        let sessions = monitor.store.get_sessions(10).await.unwrap();
        let first_row = sessions.iter().find(|s| s.id == first).unwrap();
        assert_eq!(first_row.status, "completed");
    }

    #[tokio::test]
    async fn changes_without_session_are_not_persisted() {
        let (monitor, _events) = monitor(vec![vec![fire(0.7)]], None).await;
        assert!(monitor.process_frame(frame()).await.unwrap().is_some());
        assert!(monitor.store.get_all_detections(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn alert_frames_are_saved_as_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = dir.path().join("snapshots");
        let (monitor, _events) = monitor(vec![vec![fire(0.7)]], Some(snapshots.clone())).await;
        monitor.start().await.unwrap();
        monitor.process_frame(frame()).await.unwrap();

        let detections = monitor.store.get_all_detections(1).await.unwrap();
        assert_eq!(detections.len(), 1);
        let saved: Vec<_> = std::fs::read_dir(&snapshots).unwrap().collect();
        assert_eq!(saved.len(), 1);
    }

    #[tokio::test]
    async fn frame_in_flight_during_stop_is_discarded() {
        let (monitor, mut events) = slow_monitor().await;
        monitor.start().await.unwrap();
        let mut updates = monitor.subscribe();

        let in_flight = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.process_frame(frame()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await.unwrap();

        assert!(in_flight.await.unwrap().unwrap().is_none());
        assert_eq!(monitor.status().await.fire, 0);
        assert!(monitor.last_analyzed_at().await.is_none());
        // only the cleared status from stop reached subscribers
        assert_eq!(updates.recv().await.unwrap().fire, 0);
        assert!(updates.try_recv().is_err());

        assert!(matches!(
            events.recv().await.unwrap(),
            Event::SessionStarted { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::SessionEnded { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn frame_from_previous_session_is_not_logged_after_restart() {
        let (monitor, _events) = slow_monitor().await;
        let first = monitor.start().await.unwrap();

        let in_flight = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.process_frame(frame()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = monitor.start().await.unwrap();

        assert!(in_flight.await.unwrap().unwrap().is_none());
        for session_id in [first, second] {
            let logs = monitor.store.get_session_logs(session_id).await.unwrap();
            assert!(logs.is_empty());
        }

        // frames analysed inside the new session still count
        assert!(monitor.process_frame(frame()).await.unwrap().is_some());
        let logs = monitor.store.get_session_logs(second).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn stalled_event_consumer_does_not_block_stop() {
        let detector = Arc::new(ScriptedDetector::new(vec![vec![]]));
        let (monitor, _events) = build(detector, None, 1).await;
        monitor.start().await.unwrap();
        monitor.start().await.unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(2), monitor.stop()).await;
        assert!(stopped.expect("stop returned").unwrap().is_some());
        assert!(!monitor.is_capturing());
    }

    #[tokio::test]
    async fn failed_session_start_leaves_monitor_idle() {
        let (monitor, _events) = monitor(vec![vec![fire(0.6)]], None).await;
        monitor.start().await.unwrap();
        monitor.process_frame(frame()).await.unwrap();
        assert_eq!(monitor.status().await.fire, 1);

        let db = monitor.store.db();
        db.execute_unprepared("DROP TABLE detection_logs").await.unwrap();
        db.execute_unprepared("DROP TABLE detection_sessions").await.unwrap();

        assert!(matches!(
            monitor.start().await,
            Err(ServiceError::ServiceUnavailable(_))
        ));
        assert!(!monitor.is_capturing());
        assert_eq!(monitor.current_session().await, None);
        assert_eq!(monitor.status().await.fire, 0);
    }
}
