use crate::config::AppConfig;
use crate::metrics::{
    increment_counter, CAPTURE_FAILURES, CAPTURE_RECONNECTS, FRAMES_CAPTURED, FRAMES_DROPPED,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
/// Upper bound on buffered bytes while looking for a frame boundary
const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to open stream: {0}")]
    Open(String),
    #[error("Timed out waiting for a frame")]
    Timeout,
    #[error("Stream ended")]
    EndOfStream,
    #[error("Source is not open")]
    NotOpen,
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded camera frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }

    pub fn from_jpeg(data: &[u8]) -> Result<Self, CaptureError> {
        let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8();
        Ok(Self::new(image))
    }
}

/// A video source that yields decoded frames
#[async_trait]
pub trait FrameSource: Send {
    async fn open(&mut self) -> Result<(), CaptureError>;

    async fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    async fn close(&mut self);
}

/// Reads an RTSP stream through an `ffmpeg` child process that re-encodes it
/// as MJPEG on stdout.
pub struct FfmpegSource {
    ffmpeg_path: String,
    url: String,
    fps: u32,
    open_timeout: Duration,
    read_timeout: Duration,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    buffer: BytesMut,
    pending: Option<Frame>,
}

impl FfmpegSource {
    pub fn new(
        ffmpeg_path: impl Into<String>,
        url: impl Into<String>,
        fps: u32,
        open_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            url: url.into(),
            fps,
            open_timeout,
            read_timeout,
            child: None,
            stdout: None,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            pending: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.ffmpeg_path.clone(),
            config.rtsp_url.clone(),
            config.capture_fps,
            config.capture_open_timeout(),
            config.capture_read_timeout(),
        )
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        if self.url.starts_with("rtsp://") || self.url.starts_with("rtsps://") {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        cmd.args(["-i", &self.url, "-an"])
            .args(["-vf", &format!("fps={}", self.fps)])
            .args(["-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "5", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn next_jpeg(&mut self) -> Result<Bytes, CaptureError> {
        let stdout = self.stdout.as_mut().ok_or(CaptureError::NotOpen)?;
        loop {
            if let Some(jpeg) = extract_jpeg(&mut self.buffer) {
                return Ok(jpeg);
            }
            if self.buffer.len() > MAX_PENDING_BYTES {
                warn!(
                    buffered = self.buffer.len(),
                    "Discarding oversized partial frame"
                );
                self.buffer.clear();
            }
            self.buffer.reserve(READ_CHUNK);
            if stdout.read_buf(&mut self.buffer).await? == 0 {
                return Err(CaptureError::EndOfStream);
            }
        }
    }

    async fn decode_next(&mut self, limit: Duration) -> Result<Frame, CaptureError> {
        let jpeg = timeout(limit, self.next_jpeg())
            .await
            .map_err(|_| CaptureError::Timeout)??;
        Frame::from_jpeg(&jpeg)
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn open(&mut self) -> Result<(), CaptureError> {
        self.close().await;

        let mut child = self
            .command()
            .spawn()
            .map_err(|e| CaptureError::Open(format!("failed to spawn {}: {}", self.ffmpeg_path, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Open("ffmpeg stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "firewatch::ffmpeg", "{}", line);
                }
            });
        }

        self.child = Some(child);
        self.stdout = Some(stdout);

        // The stream only counts as open once the first frame arrives
        match self.decode_next(self.open_timeout).await {
            Ok(frame) => {
                self.pending = Some(frame);
                Ok(())
            }
            Err(e) => {
                self.close().await;
                Err(CaptureError::Open(e.to_string()))
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.decode_next(self.read_timeout).await
    }

    async fn close(&mut self) {
        self.stdout = None;
        self.pending = None;
        self.buffer.clear();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!("ffmpeg already exited: {}", e);
            }
            let _ = child.wait().await;
        }
    }
}

/// Splits the next complete JPEG image off the front of `buffer`.
/// Bytes before the start-of-image marker are discarded.
fn extract_jpeg(buffer: &mut BytesMut) -> Option<Bytes> {
    let start = find_marker(buffer, JPEG_SOI, 0)?;
    if start > 0 {
        let _ = buffer.split_to(start);
    }
    let end = find_marker(buffer, JPEG_EOI, JPEG_SOI.len())?;
    Some(buffer.split_to(end + JPEG_EOI.len()).freeze())
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

/// Bounded frame buffer between capture and detection. Pushing into a full
/// queue drops the oldest frame so detection always sees recent images.
pub struct FrameQueue {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify: Notify,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Returns `true` when an older frame had to be dropped
    pub async fn push(&self, frame: Frame) -> bool {
        let dropped = {
            let mut frames = self.frames.lock().await;
            let dropped = if frames.len() >= self.capacity {
                frames.pop_front();
                true
            } else {
                false
            };
            frames.push_back(frame);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Waits up to `wait` for a frame
    pub async fn pop(&self, wait: Duration) -> Option<Frame> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(frame) = self.frames.lock().await.pop_front() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    pub async fn clear(&self) {
        self.frames.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.frames.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.frames.lock().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Reconnect once more than this many reads in a row have failed
    pub max_consecutive_failures: u32,
    pub reconnect_delay: Duration,
    /// Pause after a single failed read
    pub failure_backoff: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            reconnect_delay: Duration::from_secs(2),
            failure_backoff: Duration::from_millis(100),
        }
    }
}

impl From<&AppConfig> for CaptureSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_consecutive_failures: config.capture_max_consecutive_failures,
            reconnect_delay: config.capture_reconnect_delay(),
            ..Default::default()
        }
    }
}

/// Capture loop. Idles while `capturing` is false, keeps the source open
/// while it is true and returns once the sender side is dropped.
pub async fn run_capture<S: FrameSource>(
    mut source: S,
    queue: Arc<FrameQueue>,
    mut capturing: watch::Receiver<bool>,
    settings: CaptureSettings,
) {
    info!("Capture worker started");

    loop {
        while !*capturing.borrow_and_update() {
            if capturing.changed().await.is_err() {
                info!("Capture worker stopped");
                return;
            }
        }

        if let Err(e) = source.open().await {
            warn!("Failed to open video stream: {}. Retrying...", e);
            increment_counter(CAPTURE_RECONNECTS);
            tokio::select! {
                _ = sleep(settings.reconnect_delay) => {}
                changed = capturing.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        info!("Video stream connected");
        let mut consecutive_failures = 0u32;

        while *capturing.borrow() {
            tokio::select! {
                result = source.read_frame() => match result {
                    Ok(frame) => {
                        consecutive_failures = 0;
                        increment_counter(FRAMES_CAPTURED);
                        if queue.push(frame).await {
                            increment_counter(FRAMES_DROPPED);
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        increment_counter(CAPTURE_FAILURES);
                        warn!(attempt = consecutive_failures, "Failed to read frame: {}", e);
                        if consecutive_failures > settings.max_consecutive_failures {
                            warn!("Too many consecutive read failures, reconnecting");
                            increment_counter(CAPTURE_RECONNECTS);
                            break;
                        }
                        sleep(settings.failure_backoff).await;
                    }
                },
                changed = capturing.changed() => {
                    if changed.is_err() {
                        source.close().await;
                        info!("Capture worker stopped");
                        return;
                    }
                }
            }
        }

        source.close().await;
        debug!("Video stream closed");
    }
}
