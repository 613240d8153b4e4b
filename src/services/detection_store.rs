use crate::{
    db::DbPool,
    entities::{
        detection, detection_log, detection_session, detection_session::SessionStatus, Detection,
        DetectionLog, DetectionSession,
    },
    errors::ServiceError,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sea_orm::{
    sea_query::{Expr, Func, SimpleExpr},
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_DETECTIONS_LIMIT: u64 = 100;
pub const DEFAULT_SESSIONS_LIMIT: u64 = 50;
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Session row as returned by the reports API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_fire: i32,
    pub total_smoke: i32,
    pub status: String,
}

impl From<detection_session::Model> for SessionSummary {
    fn from(model: detection_session::Model) -> Self {
        Self {
            id: model.id,
            start_time: model.start_time,
            end_time: model.end_time,
            total_fire: model.total_fire_detections,
            total_smoke: model.total_smoke_detections,
            status: model.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLogEntry {
    pub id: i32,
    pub timestamp: DateTime<Utc>,
    pub fire_count: i32,
    pub smoke_count: i32,
    pub alert_triggered: bool,
}

impl From<detection_log::Model> for SessionLogEntry {
    fn from(model: detection_log::Model) -> Self {
        Self {
            id: model.id,
            timestamp: model.timestamp,
            fire_count: model.fire_count,
            smoke_count: model.smoke_count,
            alert_triggered: model.alert_triggered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i32,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub detection_type: String,
    pub count: i32,
    pub confidence: Option<f64>,
}

impl From<detection::Model> for DetectionRecord {
    fn from(model: detection::Model) -> Self {
        Self {
            id: model.id,
            timestamp: model.timestamp,
            detection_type: model.detection_type,
            count: model.count,
            confidence: model.confidence,
        }
    }
}

/// Aggregate figures shown on the reports page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_sessions: u64,
    pub total_fire_detections: i64,
    pub total_smoke_detections: i64,
    pub recent_sessions: u64,
    pub avg_fire_per_session: f64,
    pub avg_smoke_per_session: f64,
}

/// Persistence of sessions, session logs and detections.
#[derive(Clone)]
pub struct DetectionStore {
    db: Arc<DbPool>,
}

impl DetectionStore {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    /// Opens a new active session and returns its id
    #[instrument(skip(self))]
    pub async fn start_session(&self) -> Result<i32, ServiceError> {
        let session = detection_session::ActiveModel {
            start_time: Set(Utc::now()),
            end_time: Set(None),
            total_fire_detections: Set(0),
            total_smoke_detections: Set(0),
            status: Set(SessionStatus::Active.to_string()),
            ..Default::default()
        };

        let saved = session.insert(&*self.db).await?;
        info!(session_id = saved.id, "Detection session started");
        Ok(saved.id)
    }

    /// Closes a session, folding its log counts into the session totals
    #[instrument(skip(self))]
    pub async fn end_session(&self, session_id: i32) -> Result<SessionSummary, ServiceError> {
        let session = DetectionSession::find_by_id(session_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Session {} not found", session_id)))?;

        let (fire_total, smoke_total) = DetectionLog::find()
            .select_only()
            .column_as(Expr::col(detection_log::Column::FireCount).sum(), "fire_total")
            .column_as(Expr::col(detection_log::Column::SmokeCount).sum(), "smoke_total")
            .filter(detection_log::Column::SessionId.eq(session_id))
            .into_tuple::<(Option<i64>, Option<i64>)>()
            .one(&*self.db)
            .await?
            .unwrap_or((None, None));

        let mut active: detection_session::ActiveModel = session.into();
        active.end_time = Set(Some(Utc::now()));
        active.total_fire_detections = Set(saturating_i32(fire_total.unwrap_or(0)));
        active.total_smoke_detections = Set(saturating_i32(smoke_total.unwrap_or(0)));
        active.status = Set(SessionStatus::Completed.to_string());

        let updated = active.update(&*self.db).await?;
        info!(
            session_id,
            total_fire = updated.total_fire_detections,
            total_smoke = updated.total_smoke_detections,
            "Detection session completed"
        );
        Ok(updated.into())
    }

    /// Completes every session still marked active, e.g. after an unclean shutdown
    #[instrument(skip(self))]
    pub async fn close_active_sessions(&self) -> Result<usize, ServiceError> {
        let ids: Vec<i32> = DetectionSession::find()
            .select_only()
            .column(detection_session::Column::Id)
            .filter(detection_session::Column::Status.eq(SessionStatus::Active.as_ref()))
            .into_tuple()
            .all(&*self.db)
            .await?;

        for id in &ids {
            self.end_session(*id).await?;
        }
        if !ids.is_empty() {
            warn!(count = ids.len(), "Closed sessions left active");
        }
        Ok(ids.len())
    }

    pub async fn add_detection_log(
        &self,
        session_id: i32,
        fire_count: u32,
        smoke_count: u32,
        alert_triggered: bool,
    ) -> Result<i32, ServiceError> {
        let log = detection_log::ActiveModel {
            session_id: Set(session_id),
            timestamp: Set(Utc::now()),
            fire_count: Set(saturating_i32(fire_count.into())),
            smoke_count: Set(saturating_i32(smoke_count.into())),
            alert_triggered: Set(alert_triggered),
            ..Default::default()
        };

        let saved = log.insert(&*self.db).await?;
        debug!(session_id, log_id = saved.id, "Detection log written");
        Ok(saved.id)
    }

    pub async fn add_detection(
        &self,
        detection_type: &str,
        count: u32,
        confidence: Option<f64>,
        image_path: Option<String>,
    ) -> Result<i32, ServiceError> {
        if detection_type.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "detection_type must not be empty".to_string(),
            ));
        }

        let record = detection::ActiveModel {
            timestamp: Set(Utc::now()),
            detection_type: Set(detection_type.to_string()),
            count: Set(saturating_i32(count.into())),
            confidence: Set(confidence),
            image_path: Set(image_path),
            ..Default::default()
        };

        let saved = record.insert(&*self.db).await?;
        Ok(saved.id)
    }

    /// Newest detections first
    pub async fn get_all_detections(
        &self,
        limit: u64,
    ) -> Result<Vec<DetectionRecord>, ServiceError> {
        let rows = Detection::find()
            .order_by_desc(detection::Column::Timestamp)
            .order_by_desc(detection::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Newest sessions first
    pub async fn get_sessions(&self, limit: u64) -> Result<Vec<SessionSummary>, ServiceError> {
        let rows = DetectionSession::find()
            .order_by_desc(detection_session::Column::StartTime)
            .order_by_desc(detection_session::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Logs of one session in chronological order. Unknown ids yield an empty list.
    pub async fn get_session_logs(
        &self,
        session_id: i32,
    ) -> Result<Vec<SessionLogEntry>, ServiceError> {
        let rows = DetectionLog::find()
            .filter(detection_log::Column::SessionId.eq(session_id))
            .order_by_asc(detection_log::Column::Timestamp)
            .order_by_asc(detection_log::Column::Id)
            .all(&*self.db)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    pub async fn get_statistics(&self) -> Result<Statistics, ServiceError> {
        let db = &*self.db;

        let total_sessions = DetectionSession::find().count(db).await?;

        let (fire_sum, smoke_sum) = DetectionSession::find()
            .select_only()
            .column_as(
                Expr::col(detection_session::Column::TotalFireDetections).sum(),
                "fire_sum",
            )
            .column_as(
                Expr::col(detection_session::Column::TotalSmokeDetections).sum(),
                "smoke_sum",
            )
            .into_tuple::<(Option<i64>, Option<i64>)>()
            .one(db)
            .await?
            .unwrap_or((None, None));

        let since = Utc::now() - Duration::hours(24);
        let recent_sessions = DetectionSession::find()
            .filter(detection_session::Column::StartTime.gte(since))
            .count(db)
            .await?;

        let (avg_fire, avg_smoke) = DetectionSession::find()
            .select_only()
            .column_as(
                SimpleExpr::from(Func::avg(Expr::col(
                    detection_session::Column::TotalFireDetections,
                ))),
                "avg_fire",
            )
            .column_as(
                SimpleExpr::from(Func::avg(Expr::col(
                    detection_session::Column::TotalSmokeDetections,
                ))),
                "avg_smoke",
            )
            .filter(detection_session::Column::Status.eq(SessionStatus::Completed.as_ref()))
            .into_tuple::<(Option<f64>, Option<f64>)>()
            .one(db)
            .await?
            .unwrap_or((None, None));

        Ok(Statistics {
            total_sessions,
            total_fire_detections: fire_sum.unwrap_or(0),
            total_smoke_detections: smoke_sum.unwrap_or(0),
            recent_sessions,
            avg_fire_per_session: round2(avg_fire.unwrap_or(0.0)),
            avg_smoke_per_session: round2(avg_smoke.unwrap_or(0.0)),
        })
    }

    /// Sessions started within `[start, end]`, or the latest sessions when
    /// either bound is missing.
    #[instrument(skip(self))]
    pub async fn get_detections_by_date(
        &self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<SessionSummary>, ServiceError> {
        let (start, end) = match (non_empty(start), non_empty(end)) {
            (Some(start), Some(end)) => (
                parse_bound(start, BoundKind::Start)?,
                parse_bound(end, BoundKind::End)?,
            ),
            _ => return self.get_sessions(DEFAULT_DETECTIONS_LIMIT).await,
        };

        if start > end {
            return Err(ServiceError::ValidationError(
                "start_date must not be after end_date".to_string(),
            ));
        }

        let rows = DetectionSession::find()
            .filter(detection_session::Column::StartTime.between(start, end))
            .order_by_desc(detection_session::Column::StartTime)
            .order_by_desc(detection_session::Column::Id)
            .all(&*self.db)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Removes sessions, their logs and detections older than `days`.
    /// Active sessions are kept regardless of age. Returns the number of rows deleted.
    #[instrument(skip(self))]
    pub async fn delete_old_records(&self, days: i64) -> Result<u64, ServiceError> {
        if days < 0 {
            return Err(ServiceError::ValidationError(
                "days must not be negative".to_string(),
            ));
        }

        let cutoff = Utc::now() - Duration::days(days);
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let old_sessions: Vec<i32> = DetectionSession::find()
            .select_only()
            .column(detection_session::Column::Id)
            .filter(detection_session::Column::StartTime.lt(cutoff))
            .filter(detection_session::Column::Status.ne(SessionStatus::Active.as_ref()))
            .into_tuple()
            .all(&txn)
            .await?;

        let mut deleted = 0;
        if !old_sessions.is_empty() {
            deleted += DetectionLog::delete_many()
                .filter(detection_log::Column::SessionId.is_in(old_sessions.clone()))
                .exec(&txn)
                .await?
                .rows_affected;
            deleted += DetectionSession::delete_many()
                .filter(detection_session::Column::Id.is_in(old_sessions))
                .exec(&txn)
                .await?
                .rows_affected;
        }
        deleted += Detection::delete_many()
            .filter(detection::Column::Timestamp.lt(cutoff))
            .exec(&txn)
            .await?
            .rows_affected;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(days, deleted, "Old detection records pruned");
        Ok(deleted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundKind {
    Start,
    End,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_bound(raw: &str, kind: BoundKind) -> Result<DateTime<Utc>, ServiceError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ServiceError::ValidationError(format!("Invalid date bound: {}", raw)))?;
    let naive = match kind {
        BoundKind::Start => date.and_hms_opt(0, 0, 0),
        BoundKind::End => date.and_hms_nano_opt(23, 59, 59, 999_999_999),
    }
    .ok_or_else(|| ServiceError::ValidationError(format!("Invalid date bound: {}", raw)))?;

    Ok(Utc.from_utc_datetime(&naive))
}

fn saturating_i32(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(if value < 0 { i32::MIN } else { i32::MAX })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use assert_matches::assert_matches;

    async fn store() -> DetectionStore {
        let pool = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("in-memory sqlite");
        run_migrations(&pool).await.expect("migrations");
        DetectionStore::new(Arc::new(pool))
    }

    async fn backdate_session(store: &DetectionStore, id: i32, days: i64) {
        let session = DetectionSession::find_by_id(id)
            .one(store.db())
            .await
            .unwrap()
            .unwrap();
        let mut active: detection_session::ActiveModel = session.into();
        active.start_time = Set(Utc::now() - Duration::days(days));
        active.update(store.db()).await.unwrap();
    }

    #[tokio::test]
    async fn end_session_sums_log_counts() {
        let store = store().await;
        let id = store.start_session().await.unwrap();
        store.add_detection_log(id, 2, 0, true).await.unwrap();
        store.add_detection_log(id, 1, 3, true).await.unwrap();
        store.add_detection_log(id, 0, 0, false).await.unwrap();

        let summary = store.end_session(id).await.unwrap();
        assert_eq!(summary.total_fire, 3);
        assert_eq!(summary.total_smoke, 3);
        assert_eq!(summary.status, "completed");
        assert!(summary.end_time.is_some());
    }

    #[tokio::test]
    async fn end_session_without_logs_has_zero_totals() {
        let store = store().await;
        let id = store.start_session().await.unwrap();
        let summary = store.end_session(id).await.unwrap();
        assert_eq!((summary.total_fire, summary.total_smoke), (0, 0));
    }

    #[tokio::test]
    async fn end_unknown_session_is_not_found() {
        let store = store().await;
        assert_matches!(store.end_session(999).await, Err(ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn session_logs_are_chronological_and_unknown_is_empty() {
        let store = store().await;
        let id = store.start_session().await.unwrap();
        store.add_detection_log(id, 1, 0, true).await.unwrap();
        store.add_detection_log(id, 0, 0, false).await.unwrap();

        let logs = store.get_session_logs(id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].fire_count, 1);
        assert!(logs[0].alert_triggered);
        assert!(!logs[1].alert_triggered);

        assert!(store.get_session_logs(4242).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn statistics_average_completed_sessions_only() {
        let store = store().await;

        let first = store.start_session().await.unwrap();
        store.add_detection_log(first, 1, 1, true).await.unwrap();
        store.end_session(first).await.unwrap();

        let second = store.start_session().await.unwrap();
        store.add_detection_log(second, 2, 0, true).await.unwrap();
        store.end_session(second).await.unwrap();

        let third = store.start_session().await.unwrap();
        store.add_detection_log(third, 0, 0, false).await.unwrap();
        store.end_session(third).await.unwrap();

        // Still active, counts only towards totals of sessions
        store.start_session().await.unwrap();

        let stats = store.get_statistics().await.unwrap();
        assert_eq!(stats.total_sessions, 4);
        assert_eq!(stats.recent_sessions, 4);
        assert_eq!(stats.total_fire_detections, 3);
        assert_eq!(stats.total_smoke_detections, 1);
        assert_eq!(stats.avg_fire_per_session, 1.0);
        assert_eq!(stats.avg_smoke_per_session, 0.33);
    }

    #[tokio::test]
    async fn statistics_on_empty_database_are_zero() {
        let store = store().await;
        let stats = store.get_statistics().await.unwrap();
        assert_eq!(stats.total_sessions, 0);
        assert_eq!(stats.total_fire_detections, 0);
        assert_eq!(stats.avg_fire_per_session, 0.0);
    }

    #[tokio::test]
    async fn detections_are_listed_newest_first() {
        let store = store().await;
        store.add_detection("fire", 1, Some(0.8), None).await.unwrap();
        store.add_detection("smoke", 2, Some(0.6), None).await.unwrap();
        store.add_detection("fire", 3, None, None).await.unwrap();

        let all = store.get_all_detections(2).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].count, 3);
        assert_eq!(all[1].detection_type, "smoke");
    }

    #[tokio::test]
    async fn empty_detection_type_is_rejected() {
        let store = store().await;
        assert_matches!(
            store.add_detection("  ", 1, None, None).await,
            Err(ServiceError::InvalidInput(_))
        );
    }

    #[tokio::test]
    async fn date_range_filters_on_start_time() {
        let store = store().await;
        let old = store.start_session().await.unwrap();
        store.end_session(old).await.unwrap();
        backdate_session(&store, old, 10).await;
        let recent = store.start_session().await.unwrap();

        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let sessions = store
            .get_detections_by_date(Some(&today), Some(&today))
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, recent);

        let all = store.get_detections_by_date(None, Some(&today)).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, recent);
    }

    #[tokio::test]
    async fn unparseable_bound_is_a_validation_error() {
        let store = store().await;
        assert_matches!(
            store
                .get_detections_by_date(Some("yesterday"), Some("2024-01-01"))
                .await,
            Err(ServiceError::ValidationError(_))
        );
    }

    #[tokio::test]
    async fn delete_old_records_keeps_recent_and_active_sessions() {
        let store = store().await;

        let old = store.start_session().await.unwrap();
        store.add_detection_log(old, 1, 0, true).await.unwrap();
        store.add_detection_log(old, 0, 0, false).await.unwrap();
        store.end_session(old).await.unwrap();
        backdate_session(&store, old, 40).await;

        let stale_active = store.start_session().await.unwrap();
        backdate_session(&store, stale_active, 40).await;

        let recent = store.start_session().await.unwrap();
        store.add_detection_log(recent, 1, 1, true).await.unwrap();

        let deleted = store.delete_old_records(30).await.unwrap();
        // two logs and one session
        assert_eq!(deleted, 3);

        let remaining: Vec<i32> = store
            .get_sessions(DEFAULT_SESSIONS_LIMIT)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert!(remaining.contains(&recent));
        assert!(remaining.contains(&stale_active));
        assert!(!remaining.contains(&old));
        assert_eq!(store.get_session_logs(recent).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_active_sessions_completes_leftovers() {
        let store = store().await;
        store.start_session().await.unwrap();
        store.start_session().await.unwrap();
        assert_eq!(store.close_active_sessions().await.unwrap(), 2);
        let sessions = store.get_sessions(10).await.unwrap();
        assert!(sessions.iter().all(|s| s.status == "completed"));
    }

    #[test]
    fn date_only_end_bound_covers_the_whole_day() {
        let end = parse_bound("2024-03-05", BoundKind::End).unwrap();
        assert_eq!(end.format("%H:%M:%S").to_string(), "23:59:59");
        let start = parse_bound("2024-03-05", BoundKind::Start).unwrap();
        assert_eq!(start.format("%H:%M:%S").to_string(), "00:00:00");
        let precise = parse_bound("2024-03-05 10:30:00", BoundKind::End).unwrap();
        assert_eq!(precise.format("%H:%M").to_string(), "10:30");
        assert!(parse_bound("2024-03-05T10:30:00+02:00", BoundKind::Start).is_ok());
    }

    #[test]
    fn rounding_keeps_two_decimals() {
        assert_eq!(round2(1.0 / 3.0), 0.33);
        assert_eq!(round2(2.0 / 3.0), 0.67);
    }
}
