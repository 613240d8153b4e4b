use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use firewatch::{
    config,
    db,
    services::detection_store::{
        DetectionRecord, DetectionStore, SessionLogEntry, SessionSummary, Statistics,
        DEFAULT_DETECTIONS_LIMIT, DEFAULT_RETENTION_DAYS, DEFAULT_SESSIONS_LIMIT,
    },
};
use serde::Serialize;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = connect(&cli).await?;

    match cli.command {
        Commands::Stats => {
            let stats = store.get_statistics().await?;
            output(cli.json, &stats, render_statistics)?;
        }
        Commands::Sessions { limit } => {
            let sessions = store.get_sessions(limit).await?;
            output(cli.json, &sessions, |rows| render_sessions(rows))?;
        }
        Commands::Session { id } => {
            let logs = store.get_session_logs(id).await?;
            output(cli.json, &logs, |rows| render_logs(id, rows))?;
        }
        Commands::Range { start, end } => {
            let sessions = store
                .get_detections_by_date(Some(&start), Some(&end))
                .await?;
            output(cli.json, &sessions, |rows| render_sessions(rows))?;
        }
        Commands::Detections { limit } => {
            let detections = store.get_all_detections(limit).await?;
            output(cli.json, &detections, |rows| render_detections(rows))?;
        }
        Commands::Prune { days } => {
            let deleted = store.delete_old_records(days).await?;
            output(
                cli.json,
                &serde_json::json!({ "deleted": deleted }),
                |_| println!("Deleted {} record(s) older than {} day(s)", deleted, days),
            )?;
        }
        Commands::Migrate => {
            // `connect` already applied pending migrations
            println!("Database schema is up to date");
        }
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "firewatch-cli",
    about = "Inspect and maintain firewatch detection records",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[arg(
        long,
        global = true,
        help = "Database URL; defaults to the service configuration"
    )]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Overall statistics
    Stats,
    /// Most recent sessions
    Sessions {
        #[arg(long, default_value_t = DEFAULT_SESSIONS_LIMIT)]
        limit: u64,
    },
    /// Detection log of one session
    Session { id: i32 },
    /// Sessions started between two dates (YYYY-MM-DD or RFC 3339)
    Range {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
    /// Most recent detection records
    Detections {
        #[arg(long, default_value_t = DEFAULT_DETECTIONS_LIMIT)]
        limit: u64,
    },
    /// Delete records older than the given number of days
    Prune {
        #[arg(long, default_value_t = DEFAULT_RETENTION_DAYS)]
        days: i64,
    },
    /// Apply database migrations
    Migrate,
}

async fn connect(cli: &Cli) -> Result<DetectionStore> {
    let pool = match &cli.database_url {
        Some(url) => {
            config::init_tracing("warn", false);
            db::establish_connection(url).await
        }
        None => {
            let settings =
                config::load_database_settings().context("failed to load database settings")?;
            config::init_tracing("warn", settings.log_json);
            db::establish_connection_with_config(&db::DbConfig::from(&settings)).await
        }
    }
    .context("failed to connect to database")?;

    db::run_migrations(&pool)
        .await
        .context("failed to apply migrations")?;
    Ok(DetectionStore::new(Arc::new(pool)))
}

fn output<T: Serialize>(json: bool, value: &T, render: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        render(value);
    }
    Ok(())
}

fn render_statistics(stats: &Statistics) {
    println!("Sessions total        {}", stats.total_sessions);
    println!("Sessions last 24h     {}", stats.recent_sessions);
    println!("Fire detections       {}", stats.total_fire_detections);
    println!("Smoke detections      {}", stats.total_smoke_detections);
    println!("Avg fire / session    {:.2}", stats.avg_fire_per_session);
    println!("Avg smoke / session   {:.2}", stats.avg_smoke_per_session);
}

fn render_sessions(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No sessions");
        return;
    }
    println!(
        "{:>6}  {:<20}  {:<20}  {:>5}  {:>5}  {}",
        "ID", "START", "END", "FIRE", "SMOKE", "STATUS"
    );
    for s in sessions {
        println!(
            "{:>6}  {:<20}  {:<20}  {:>5}  {:>5}  {}",
            s.id,
            s.start_time.format("%Y-%m-%d %H:%M:%S"),
            s.end_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            s.total_fire,
            s.total_smoke,
            s.status
        );
    }
}

fn render_logs(session_id: i32, logs: &[SessionLogEntry]) {
    if logs.is_empty() {
        println!("No detection logs for session {}", session_id);
        return;
    }
    println!("{:<20}  {:>5}  {:>5}  ALERT", "TIME", "FIRE", "SMOKE");
    for log in logs {
        println!(
            "{:<20}  {:>5}  {:>5}  {}",
            log.timestamp.format("%Y-%m-%d %H:%M:%S"),
            log.fire_count,
            log.smoke_count,
            if log.alert_triggered { "yes" } else { "" }
        );
    }
}

fn render_detections(detections: &[DetectionRecord]) {
    if detections.is_empty() {
        println!("No detections");
        return;
    }
    println!("{:>6}  {:<20}  {:<6}  {:>5}  CONF", "ID", "TIME", "TYPE", "COUNT");
    for d in detections {
        println!(
            "{:>6}  {:<20}  {:<6}  {:>5}  {}",
            d.id,
            d.timestamp.format("%Y-%m-%d %H:%M:%S"),
            d.detection_type,
            d.count,
            d.confidence
                .map(|c| format!("{:.2}", c))
                .unwrap_or_else(|| "-".to_string())
        );
    }
}
