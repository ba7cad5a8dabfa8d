//! Engine configuration
//!
//! Values come from the process environment (a `.env` file is honoured when
//! present). Every key has a default so the engine can start against a local
//! database without any setup.

use std::time::Duration;

use crate::database::DatabaseConfig;
use crate::import_export::error_log::{DEFAULT_ERROR_LOG_CAPACITY, DEFAULT_ERROR_LOG_TTL};

/// Runtime settings shared by all registry services.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    /// Schema that holds the physical registry tables.
    pub registry_schema: String,
    /// Uploads above this many bytes go to the external file store.
    pub max_inline_file_size: u64,
    /// Time-based expiry for metadata caches, on top of version invalidation.
    pub cache_ttl: Duration,
    /// How long an unfetched import error report is kept.
    pub error_log_ttl: Duration,
    /// Import error reports kept at most; the oldest goes first.
    pub error_log_capacity: usize,
    /// Projection of geometries sent by the map client.
    pub source_srid: i32,
    /// Used when a layer's feature table carries no SRID.
    pub default_srid: i32,
    pub bind_addr: String,
    /// Directory backing the large-file store; uploads above the inline
    /// limit fail when unset.
    pub file_store_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            registry_schema: "register".to_string(),
            max_inline_file_size: 10 * 1024 * 1024,
            cache_ttl: Duration::from_secs(600),
            error_log_ttl: DEFAULT_ERROR_LOG_TTL,
            error_log_capacity: DEFAULT_ERROR_LOG_CAPACITY,
            source_srid: 3857,
            default_srid: 3857,
            bind_addr: "0.0.0.0:4200".to_string(),
            file_store_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Self {
            database: DatabaseConfig::default(),
            registry_schema: std::env::var("REGISTRY_SCHEMA")
                .unwrap_or(defaults.registry_schema),
            max_inline_file_size: env_parse::<u64>("REGISTRY_MAX_FILE_SIZE_MB")
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.max_inline_file_size),
            cache_ttl: env_parse::<u64>("REGISTRY_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            error_log_ttl: env_parse::<u64>("REGISTRY_ERROR_LOG_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.error_log_ttl),
            error_log_capacity: env_parse("REGISTRY_ERROR_LOG_CAPACITY")
                .unwrap_or(defaults.error_log_capacity),
            source_srid: env_parse("REGISTRY_SOURCE_SRID").unwrap_or(defaults.source_srid),
            default_srid: env_parse("REGISTRY_DEFAULT_SRID").unwrap_or(defaults.default_srid),
            bind_addr: std::env::var("REGISTRY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            file_store_dir: std::env::var("REGISTRY_FILE_STORE_DIR").ok(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
