use crate::{
    services::detection_store::{
        DetectionRecord, SessionLogEntry, SessionSummary, Statistics, DEFAULT_DETECTIONS_LIMIT,
        DEFAULT_RETENTION_DAYS, DEFAULT_SESSIONS_LIMIT,
    },
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use super::HandlerResult;

#[derive(Debug, Default, Deserialize, Validate)]
pub struct LimitQuery {
    #[validate(range(min = 1, max = 1000))]
    pub limit: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DateRangeQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct PruneQuery {
    #[validate(range(min = 0, max = 36500))]
    pub days: Option<i64>,
}

pub async fn statistics(State(state): State<AppState>) -> HandlerResult<Statistics> {
    Ok(Json(state.store.get_statistics().await?))
}

pub async fn sessions(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> HandlerResult<Vec<SessionSummary>> {
    query.validate()?;
    let limit = query.limit.unwrap_or(DEFAULT_SESSIONS_LIMIT);
    Ok(Json(state.store.get_sessions(limit).await?))
}

pub async fn session_logs(
    State(state): State<AppState>,
    Path(session_id): Path<i32>,
) -> HandlerResult<Vec<SessionLogEntry>> {
    Ok(Json(state.store.get_session_logs(session_id).await?))
}

pub async fn date_range(
    State(state): State<AppState>,
    Query(query): Query<DateRangeQuery>,
) -> HandlerResult<Vec<SessionSummary>> {
    let sessions = state
        .store
        .get_detections_by_date(query.start_date.as_deref(), query.end_date.as_deref())
        .await?;
    Ok(Json(sessions))
}

pub async fn detections(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> HandlerResult<Vec<DetectionRecord>> {
    query.validate()?;
    let limit = query.limit.unwrap_or(DEFAULT_DETECTIONS_LIMIT);
    Ok(Json(state.store.get_all_detections(limit).await?))
}

/// Deletes records older than `days` (default 30)
pub async fn prune(
    State(state): State<AppState>,
    Query(query): Query<PruneQuery>,
) -> HandlerResult<Value> {
    query.validate()?;
    let days = query.days.unwrap_or(DEFAULT_RETENTION_DAYS);
    let deleted = state.store.delete_old_records(days).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_bounds_are_enforced() {
        assert!(LimitQuery { limit: Some(50) }.validate().is_ok());
        assert!(LimitQuery { limit: None }.validate().is_ok());
        assert!(LimitQuery { limit: Some(0) }.validate().is_err());
        assert!(LimitQuery { limit: Some(1001) }.validate().is_err());
        assert!(PruneQuery { days: Some(-1) }.validate().is_err());
    }
}
