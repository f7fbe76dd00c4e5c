use chrono::Duration;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "BRL";
const DEFAULT_HOLD_TTL_MINUTES: i64 = 15;
const DEFAULT_QUOTE_TTL_MINUTES: i64 = 30;
const DEFAULT_IDEMPOTENCY_TTL_HOURS: i64 = 24;
const DEFAULT_WEBHOOK_DEDUP_TTL_DAYS: i64 = 7;

/// Property-management system connection settings
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct PmsConfig {
    /// Base URL of the PMS HTTP API
    #[validate(url)]
    pub base_url: String,

    /// API key sent as a bearer token
    #[validate(length(min = 1))]
    pub api_key: String,

    /// Timeout for read endpoints, seconds
    #[serde(default = "default_pms_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Timeout for transactional write endpoints, seconds
    #[serde(default = "default_pms_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

/// Payment service provider connection settings
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct PspConfig {
    /// Base URL of the PSP HTTP API
    #[validate(url)]
    pub base_url: String,

    /// Secret API key
    #[validate(length(min = 1))]
    pub secret_key: String,

    /// Shared secret used to verify webhook signatures
    #[validate(length(min = 1))]
    pub webhook_secret: String,

    /// Accepted clock skew for webhook timestamps, seconds
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,

    /// Timeout for PSP calls, seconds
    #[serde(default = "default_psp_timeout_secs")]
    pub timeout_secs: u64,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
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
    #[validate(custom(function = validate_log_level))]
    pub log_level: String,

    /// The single currency this release charges in (ISO 4217)
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Minutes an inventory hold stays alive before the sweeper releases it
    #[serde(default = "default_hold_ttl_minutes")]
    pub hold_ttl_minutes: i64,

    /// Minutes a locked quote is presented as valid to the shopper
    #[serde(default = "default_quote_ttl_minutes")]
    pub quote_ttl_minutes: i64,

    /// Hours a captured idempotent response is replayable
    #[serde(default = "default_idempotency_ttl_hours")]
    pub idempotency_ttl_hours: i64,

    /// Days a processed webhook event id is remembered
    #[serde(default = "default_webhook_dedup_ttl_days")]
    pub webhook_dedup_ttl_days: i64,

    /// Bearer token required on /jobs/* endpoints
    #[validate(length(min = 8))]
    pub job_auth_token: String,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// PMS settings
    #[validate(nested)]
    pub pms: PmsConfig,

    /// PSP settings
    #[validate(nested)]
    pub psp: PspConfig,
}

impl AppConfig {
    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn hold_ttl(&self) -> Duration {
        Duration::minutes(self.hold_ttl_minutes)
    }

    pub fn quote_ttl(&self) -> Duration {
        Duration::minutes(self.quote_ttl_minutes)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::hours(self.idempotency_ttl_hours)
    }

    pub fn webhook_dedup_ttl(&self) -> Duration {
        Duration::days(self.webhook_dedup_ttl_days)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_hold_ttl_minutes() -> i64 {
    DEFAULT_HOLD_TTL_MINUTES
}

fn default_quote_ttl_minutes() -> i64 {
    DEFAULT_QUOTE_TTL_MINUTES
}

fn default_idempotency_ttl_hours() -> i64 {
    DEFAULT_IDEMPOTENCY_TTL_HOURS
}

fn default_webhook_dedup_ttl_days() -> i64 {
    DEFAULT_WEBHOOK_DEDUP_TTL_DAYS
}

fn default_pms_read_timeout_secs() -> u64 {
    8
}

fn default_pms_write_timeout_secs() -> u64 {
    30
}

fn default_psp_timeout_secs() -> u64 {
    15
}

fn default_webhook_tolerance_secs() -> u64 {
    300
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
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("staykit_api={},tower_http=debug", level);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = fmt().with_env_filter(filter).try_init();
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    let config = Config::builder()
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
