use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use firewatch as app;
use firewatch::events::EventHandler;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = app::config::load_config()?;
    app::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = app::db::establish_connection_from_app_config(&cfg).await?;
    app::db::check_connection(&db_pool).await?;
    if cfg.auto_migrate {
        app::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    let store = app::services::DetectionStore::new(db_arc.clone());
    // A crash may have left a session open
    store.close_active_sessions().await?;

    // Events and alerting
    let (event_sender, event_rx) = app::events::channel(EVENT_CHANNEL_CAPACITY);
    let dispatcher = app::webhooks::AlertDispatcher::from_config(&cfg)?;
    if cfg.alert_webhook_url.is_some() {
        info!("Alert webhook delivery enabled");
    } else {
        info!("Alert webhook URL not configured; alerts are only logged");
    }
    let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(dispatcher)];
    let event_task = tokio::spawn(app::events::process_events(event_rx, handlers));

    // Vision pipeline
    let detector = app::vision::HttpDetector::from_config(&cfg)
        .context("failed to build detector client")?;
    let queue = Arc::new(app::vision::FrameQueue::new(cfg.frame_queue_capacity));
    let monitor = Arc::new(app::monitor::Monitor::new(
        store.clone(),
        Arc::new(detector),
        queue.clone(),
        event_sender,
        app::monitor::MonitorSettings::from(&cfg),
    ));

    let capture_task = tokio::spawn(app::vision::run_capture(
        app::vision::FfmpegSource::from_config(&cfg),
        queue,
        monitor.capture_state(),
        app::vision::CaptureSettings::from(&cfg),
    ));
    let detection_task = tokio::spawn(app::monitor::run_detection(monitor.clone()));

    let retention_task = match cfg.retention_interval() {
        Some(every) => Some(app::services::retention::start_worker(
            store.clone(),
            i64::from(cfg.retention_days),
            every,
        )),
        None => {
            info!("Retention worker disabled");
            None
        }
    };

    let health_state = Arc::new(app::health::HealthState::new(
        db_arc.clone(),
        monitor.clone(),
    ));
    let health_task = tokio::spawn(app::health::run_health_checker(
        health_state.clone(),
        HEALTH_CHECK_INTERVAL,
    ));

    let app_state = app::AppState {
        db: db_arc.clone(),
        config: Arc::new(cfg.clone()),
        store,
        monitor: monitor.clone(),
    };
    let router = app::build_router(app_state, health_state)?;

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;
    info!("firewatch listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    if let Err(e) = monitor.stop().await {
        warn!("Failed to close the active session on shutdown: {}", e);
    }

    for task in [capture_task, detection_task, health_task] {
        task.abort();
    }
    if let Some(task) = retention_task {
        task.abort();
    }
    // Let queued events (the session end) reach the dispatcher
    drop(monitor);
    if tokio::time::timeout(Duration::from_secs(5), event_task)
        .await
        .is_err()
    {
        warn!("Event processor did not drain in time");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
