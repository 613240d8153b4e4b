use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 5000;
const CONFIG_DIR: &str = "config";
const DEFAULT_DATABASE_URL: &str = "sqlite://fire_detection.db?mode=rwc";
const DEFAULT_DETECTOR_URL: &str = "http://127.0.0.1:8000/detect";
const DEFAULT_CLASS_NAMES: [&str; 4] = ["fire", "light", "no-fire", "smoke"];

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default = "default_true_bool")]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    // ========== Capture ==========
    /// RTSP URL of the monitored camera
    #[validate(length(min = 1))]
    pub rtsp_url: String,

    /// Path or name of the ffmpeg binary used to decode the stream
    #[serde(default = "default_ffmpeg_path")]
    #[validate(length(min = 1))]
    pub ffmpeg_path: String,

    /// Frames per second requested from the decoder
    #[serde(default = "default_capture_fps")]
    #[validate(range(min = 1, max = 60))]
    pub capture_fps: u32,

    #[serde(default = "default_capture_timeout_ms")]
    pub capture_open_timeout_ms: u64,
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_read_timeout_ms: u64,

    /// Reconnect once more than this many reads in a row have failed
    #[serde(default = "default_capture_max_consecutive_failures")]
    pub capture_max_consecutive_failures: u32,

    #[serde(default = "default_capture_reconnect_delay_secs")]
    pub capture_reconnect_delay_secs: u64,

    /// Frames buffered between capture and detection; the oldest is dropped when full
    #[serde(default = "default_frame_queue_capacity")]
    #[validate(range(min = 1))]
    pub frame_queue_capacity: usize,

    // ========== Detection ==========
    /// HTTP inference endpoint
    #[serde(default = "default_detector_url")]
    #[validate(url)]
    pub detector_url: String,

    #[serde(default = "default_detector_timeout_ms")]
    pub detector_timeout_ms: u64,

    #[serde(default = "default_confidence_threshold")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f64,

    #[serde(default = "default_iou_threshold")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub iou_threshold: f64,

    /// Model class names indexed by class id
    #[serde(default = "default_class_names")]
    #[validate(length(min = 1))]
    pub class_names: Vec<String>,

    /// JPEG quality of the annotated preview stream
    #[serde(default = "default_jpeg_quality")]
    #[validate(range(min = 1, max = 100))]
    pub jpeg_quality: u8,

    /// Buffered live status updates per subscriber
    #[serde(default = "default_detection_channel_capacity")]
    #[validate(range(min = 1))]
    pub detection_channel_capacity: usize,

    #[serde(default = "default_sse_heartbeat_secs")]
    #[validate(range(min = 1))]
    pub sse_heartbeat_secs: u64,

    // ========== Alerting ==========
    #[serde(default)]
    #[validate(url)]
    pub alert_webhook_url: Option<String>,

    /// HMAC secret used to sign alert webhooks
    #[serde(default)]
    pub alert_webhook_secret: Option<String>,

    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: u64,

    /// Directory where annotated frames are saved when an alert is logged
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,

    // ========== Retention ==========
    #[serde(default = "default_retention_days")]
    #[validate(range(min = 1))]
    pub retention_days: u32,

    /// Pruning interval in seconds, 0 disables the worker
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(
        database_url: String,
        rtsp_url: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            rtsp_url,
            ffmpeg_path: default_ffmpeg_path(),
            capture_fps: default_capture_fps(),
            capture_open_timeout_ms: default_capture_timeout_ms(),
            capture_read_timeout_ms: default_capture_timeout_ms(),
            capture_max_consecutive_failures: default_capture_max_consecutive_failures(),
            capture_reconnect_delay_secs: default_capture_reconnect_delay_secs(),
            frame_queue_capacity: default_frame_queue_capacity(),
            detector_url: default_detector_url(),
            detector_timeout_ms: default_detector_timeout_ms(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            class_names: default_class_names(),
            jpeg_quality: default_jpeg_quality(),
            detection_channel_capacity: default_detection_channel_capacity(),
            sse_heartbeat_secs: default_sse_heartbeat_secs(),
            alert_webhook_url: None,
            alert_webhook_secret: None,
            alert_cooldown_secs: default_alert_cooldown_secs(),
            snapshot_dir: None,
            retention_days: default_retention_days(),
            retention_interval_secs: default_retention_interval_secs(),
        }
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true if explicit CORS origins are configured
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn capture_open_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_open_timeout_ms)
    }

    pub fn capture_read_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_read_timeout_ms)
    }

    pub fn capture_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.capture_reconnect_delay_secs)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }

    pub fn retention_interval(&self) -> Option<Duration> {
        (self.retention_interval_secs > 0).then(|| Duration::from_secs(self.retention_interval_secs))
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if self.alert_webhook_secret.is_some() && self.alert_webhook_url.is_none() {
            let mut err = ValidationError::new("alert_webhook_url_required");
            err.message = Some("alert_webhook_secret is set but alert_webhook_url is not".into());
            errors.add("alert_webhook_url", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// The database portion of [`AppConfig`], used by the maintenance CLI
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct DatabaseSettings {
    pub database_url: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,
}

fn default_true_bool() -> bool {
    true
}

fn default_db_max_connections() -> u32 {
    5
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_capture_fps() -> u32 {
    15
}
fn default_capture_timeout_ms() -> u64 {
    5000
}
fn default_capture_max_consecutive_failures() -> u32 {
    10
}
fn default_capture_reconnect_delay_secs() -> u64 {
    2
}
fn default_frame_queue_capacity() -> usize {
    2
}

fn default_detector_url() -> String {
    DEFAULT_DETECTOR_URL.to_string()
}
fn default_detector_timeout_ms() -> u64 {
    5000
}
fn default_confidence_threshold() -> f64 {
    0.4
}
fn default_iou_threshold() -> f64 {
    0.45
}
fn default_class_names() -> Vec<String> {
    DEFAULT_CLASS_NAMES.iter().map(|name| name.to_string()).collect()
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_detection_channel_capacity() -> usize {
    10
}
fn default_sse_heartbeat_secs() -> u64 {
    1
}

fn default_alert_cooldown_secs() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    30
}
fn default_retention_interval_secs() -> u64 {
    3600
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("firewatch={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Same as [`load_config`] with an explicit configuration directory
pub fn load_config_from(config_dir: &Path) -> Result<AppConfig, AppConfigError> {
    let config = layered_config(config_dir)?;

    // rtsp_url has no default: a monitoring service without a camera is a misconfiguration
    if config.get_string("rtsp_url").is_err() {
        error!("Camera URL is not configured. Set APP__RTSP_URL or rtsp_url in config/default.toml.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "rtsp_url is required but not configured. Set APP__RTSP_URL environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

/// Database settings only, read from the same layers as [`load_config`].
/// Camera, CORS and webhook settings are neither required nor validated.
pub fn load_database_settings() -> Result<DatabaseSettings, AppConfigError> {
    load_database_settings_from(Path::new(CONFIG_DIR))
}

pub fn load_database_settings_from(config_dir: &Path) -> Result<DatabaseSettings, AppConfigError> {
    let settings: DatabaseSettings = layered_config(config_dir)?.try_deserialize()?;
    settings.validate().map_err(AppConfigError::Validation)?;
    Ok(settings)
}

fn layered_config(config_dir: &Path) -> Result<Config, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", DEFAULT_DATABASE_URL)?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::from(config_dir.join("default")).required(false))
        .add_source(File::from(config_dir.join(&run_env)).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("class_names")
                .try_parsing(true),
        )
        .build()?;
    Ok(config)
}
