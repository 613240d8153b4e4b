use crate::services::detection_store::DetectionStore;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Background worker that prunes records older than `retention_days` every `every`.
pub fn start_worker(store: DetectionStore, retention_days: i64, every: Duration) -> JoinHandle<()> {
    info!(
        retention_days,
        interval_secs = every.as_secs(),
        "Starting retention worker"
    );

    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_once(&store, retention_days).await;
        }
    })
}

async fn run_once(store: &DetectionStore, retention_days: i64) -> Option<u64> {
    match store.delete_old_records(retention_days).await {
        Ok(deleted) => {
            if deleted > 0 {
                crate::metrics::increment_counter_by(crate::metrics::RECORDS_PRUNED, deleted);
            }
            info!(deleted, "retention pass finished");
            Some(deleted)
        }
        Err(e) => {
            error!("retention worker error: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use std::sync::Arc;

    #[tokio::test]
    async fn run_once_reports_deleted_rows() {
        let pool = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&pool).await.unwrap();
        let store = DetectionStore::new(Arc::new(pool));

        store.add_detection("fire", 1, Some(0.9), None).await.unwrap();
        // Zero days keeps nothing older than now
        assert_eq!(run_once(&store, 0).await, Some(1));
        assert_eq!(run_once(&store, 30).await, Some(0));
    }
}
