//! Configuration loading and types for MoorStore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: metadata persistence, the record cache, tenant QoS limits,
//! and logging.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Metadata backend settings.
    #[serde(default)]
    pub meta: MetaConfig,

    /// Metadata cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// QoS limiter settings.
    #[serde(default)]
    pub qos: QosConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Metadata backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetaConfig {
    /// Backend type: `sqlite` or `memory`.
    #[serde(default = "default_meta_backend")]
    pub backend: String,

    /// SQLite-specific configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            backend: default_meta_backend(),
            sqlite: SqliteConfig::default(),
        }
    }
}

/// SQLite-specific metadata configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_meta_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_meta_path(),
        }
    }
}

/// Metadata cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached records.
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
        }
    }
}

/// QoS limiter configuration.
///
/// The per-tenant limits come from metadata records; these values fill
/// in for tenants with no record or with non-positive fields.
#[derive(Debug, Clone, Deserialize)]
pub struct QosConfig {
    /// Seconds between snapshot refreshes of bucket owners and limits.
    #[serde(default = "default_qos_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Default read requests per second per tenant.
    #[serde(default = "default_read_qps")]
    pub default_read_qps: i64,

    /// Default write requests per second per tenant.
    #[serde(default = "default_write_qps")]
    pub default_write_qps: i64,

    /// Default download bandwidth per tenant in KB per second.
    #[serde(default = "default_bandwidth_kbps")]
    pub default_bandwidth_kbps: i64,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_qos_refresh_interval(),
            default_read_qps: default_read_qps(),
            default_write_qps: default_write_qps(),
            default_bandwidth_kbps: default_bandwidth_kbps(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_meta_backend() -> String {
    "sqlite".to_string()
}

fn default_meta_path() -> String {
    "./data/moorstore-meta.db".to_string()
}

fn default_cache_entries() -> usize {
    65536
}

fn default_qos_refresh_interval() -> u64 {
    600
}

fn default_read_qps() -> i64 {
    2000
}

fn default_write_qps() -> i64 {
    1000
}

fn default_bandwidth_kbps() -> i64 {
    // 100 MB/s.
    102400
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

/// Initialize the global tracing subscriber from the logging section.
///
/// `RUST_LOG` wins over the configured level when set.  Call once per
/// process.
pub fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

// -- Tests --------------------------------------------------------------------
