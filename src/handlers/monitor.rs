use crate::{errors::ServiceError, monitor::DetectionStatus, AppState};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{stream, Stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use super::HandlerResult;

const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Starts monitoring and opens a new session
pub async fn start_monitoring(State(state): State<AppState>) -> HandlerResult<Value> {
    let session_id = state.monitor.start().await?;
    info!(session_id, "Monitoring started");
    Ok(Json(json!({ "status": "ok", "session_id": session_id })))
}

/// Stops monitoring and completes the active session
pub async fn stop_monitoring(
    State(state): State<AppState>,
) -> Result<&'static str, ServiceError> {
    if let Some(summary) = state.monitor.stop().await? {
        info!(
            session_id = summary.id,
            total_fire = summary.total_fire,
            total_smoke = summary.total_smoke,
            "Monitoring stopped"
        );
    }
    Ok("OK")
}

pub async fn detection_status(State(state): State<AppState>) -> Json<DetectionStatus> {
    Json(state.monitor.status().await)
}

/// MJPEG stream of annotated frames. Every viewer shares the frames produced
/// by the single detection worker.
pub async fn video_feed(State(state): State<AppState>) -> Response {
    let frames = state.monitor.latest_frame();

    let body = stream::unfold(frames, |mut frames| async move {
        loop {
            frames.changed().await.ok()?;
            let latest = frames.borrow_and_update().clone();
            if let Some(jpeg) = latest {
                return Some((Ok::<_, Infallible>(multipart_chunk(&jpeg)), frames));
            }
        }
    });

    let mut response = Body::from_stream(body).into_response();
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(MJPEG_CONTENT_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn multipart_chunk(jpeg: &Bytes) -> Bytes {
    const HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut chunk = BytesMut::with_capacity(HEAD.len() + jpeg.len() + 2);
    chunk.put_slice(HEAD);
    chunk.put_slice(jpeg);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// Server-sent events with the detection status, starting with the current one
pub async fn detection_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let updates = state.monitor.subscribe();
    let current = state.monitor.status().await;

    let live = stream::unfold(updates, |mut updates| async move {
        loop {
            match updates.recv().await {
                Ok(status) => return Some((status, updates)),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "SSE subscriber lagging, skipping stale updates");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let events = stream::once(async move { current })
        .chain(live)
        .map(|status| Event::default().json_data(status));

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(state.config.sse_heartbeat_secs))
            .text("heartbeat"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_chunk_wraps_jpeg_in_frame_boundary() {
        let chunk = multipart_chunk(&Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]));
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(chunk.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }
}
