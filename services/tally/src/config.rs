use chrono_tz::Tz;
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while turning loaded settings into runtime values
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the tally service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Image cache configuration
    #[serde(default)]
    pub images: ImageConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// IANA timezone that decides where one tally day ends and the next begins
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Background flush interval in seconds (0 disables the flush task)
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

/// Database configuration
///
/// Either `url` is set, or the discrete connection fields are used.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: Option<String>,
    /// Database user
    pub user: Option<String>,
    /// Database password
    pub password: Option<String>,
    /// Database host
    pub host: Option<String>,
    /// Database port
    #[serde(default = "default_db_port")]
    pub port: u16,
    /// Database name
    pub name: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Largest accepted request body for image uploads
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Image slot cache configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    /// Parent directory for the scratch area (system temp dir when unset)
    pub scratch_root: Option<PathBuf>,
}

// Default value functions
fn default_service_name() -> String {
    "tally-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_timezone() -> String {
    "Asia/Makassar".to_string()
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_db_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::builder_with_defaults()?
            // Add config file if present
            .add_source(config::File::with_name("config/tally").required(false))
            .add_source(config::File::with_name("/etc/tally/tally").required(false))
            // Override with environment variables
            // TALLY__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("TALLY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    fn builder_with_defaults(
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("service.name", "tally-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .set_default("service.timezone", "Asia/Makassar")
    }

    /// Parse the configured timezone identifier
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.service
            .timezone
            .parse::<Tz>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "service.timezone".to_string(),
                message: e.to_string(),
            })
    }

    /// Background flush interval, `None` when disabled
    pub fn flush_interval(&self) -> Option<Duration> {
        match self.service.flush_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl DatabaseConfig {
    /// Get database connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Build PostgreSQL connect options from the URL or the discrete fields
    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        if let Some(ref url) = self.url {
            return url
                .parse::<PgConnectOptions>()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "database.url".to_string(),
                    message: e.to_string(),
                });
        }

        let host = self
            .host
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired("database.url or database.host".into()))?;

        let mut options = PgConnectOptions::new().host(host).port(self.port);
        if let Some(ref user) = self.user {
            options = options.username(user);
        }
        if let Some(ref password) = self.password {
            options = options.password(password);
        }
        if let Some(ref name) = self.name {
            options = options.database(name);
        }

        Ok(options)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
            timezone: default_timezone(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            user: None,
            password: None,
            host: None,
            port: default_db_port(),
            name: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}
