// # Gateway Configuration
//
// Runtime configuration for the gateway, loaded from environment variables
// with documented defaults. The database URL is the only required setting.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Catalog / schema cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL of a reflected catalog snapshot, in seconds
    pub schema_ttl: Duration,

    /// Reserved: TTL of per-role privilege lookups
    pub role_privileges_ttl: Duration,

    /// Reserved: TTL of generated GraphQL artifacts
    pub graphql_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            schema_ttl: Duration::from_secs(1800),
            role_privileges_ttl: Duration::from_secs(900),
            graphql_ttl: Duration::from_secs(3600),
        }
    }
}

/// Query-shape and request limits applied before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Maximum selection-set nesting depth
    pub max_depth: usize,

    /// Maximum complexity score
    pub max_complexity: usize,

    /// Maximum accepted request body, in bytes
    pub max_request_bytes: usize,

    /// Filter the generated schema by the bound role's privileges
    pub role_based_schema: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_complexity: 500,
            max_request_bytes: 1024 * 1024,
            role_based_schema: false,
        }
    }
}

/// Logical-replication consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcConfig {
    /// Start the CDC engine at boot
    pub enabled: bool,

    /// Logical replication slot consumed by this process
    pub slot_name: String,

    /// Publication whose tables are captured
    pub publication_name: String,

    /// Heartbeat cadence for live subscribers
    pub heartbeat_interval: Duration,
}

impl Default for CdcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            slot_name: "postgate_cdc".to_string(),
            publication_name: "postgate_pub".to_string(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Postgres connection string
    pub database_url: String,

    /// Database schema exposed through GraphQL
    pub schema: String,

    /// Reflector/dialect registry key
    pub database_type: String,

    /// HTTP bind address
    pub listen_addr: String,

    /// Connection pool size
    pub pool_max_connections: u32,

    pub cache: CacheConfig,
    pub security: SecurityConfig,
    pub cdc: CdcConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            schema: "public".to_string(),
            database_type: "postgres".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            pool_max_connections: 16,
            cache: CacheConfig::default(),
            security: SecurityConfig::default(),
            cdc: CdcConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the environment. `PG_DATABASE_URL` is
    /// required; everything else falls back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.database_url = env::var("PG_DATABASE_URL")
            .map_err(|_| GatewayError::Configuration("PG_DATABASE_URL is not set".to_string()))?;

        if let Ok(schema) = env::var("PG_SCHEMA") {
            config.schema = schema;
        }
        if let Ok(kind) = env::var("PG_DATABASE_TYPE") {
            config.database_type = kind;
        }
        if let Ok(addr) = env::var("PG_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(n) = env_parse::<u32>("PG_POOL_MAX_CONNECTIONS")? {
            config.pool_max_connections = n;
        }

        if let Some(secs) = env_parse::<u64>("PG_CACHE_SCHEMA_TTL_SECS")? {
            config.cache.schema_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PG_CACHE_ROLE_PRIVILEGES_TTL_SECS")? {
            config.cache.role_privileges_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PG_CACHE_GRAPHQL_TTL_SECS")? {
            config.cache.graphql_ttl = Duration::from_secs(secs);
        }

        if let Some(depth) = env_parse::<usize>("PG_SECURITY_MAX_DEPTH")? {
            config.security.max_depth = depth;
        }
        if let Some(score) = env_parse::<usize>("PG_SECURITY_MAX_COMPLEXITY")? {
            config.security.max_complexity = score;
        }
        if let Some(bytes) = env_parse::<usize>("PG_SECURITY_MAX_REQUEST_BYTES")? {
            config.security.max_request_bytes = bytes;
        }
        if let Some(enabled) = env_parse::<bool>("PG_SECURITY_ROLE_BASED_SCHEMA")? {
            config.security.role_based_schema = enabled;
        }

        if let Some(enabled) = env_parse::<bool>("PG_CDC_ENABLED")? {
            config.cdc.enabled = enabled;
        }
        if let Ok(slot) = env::var("PG_CDC_SLOT_NAME") {
            config.cdc.slot_name = slot;
        }
        if let Ok(publication) = env::var("PG_CDC_PUBLICATION_NAME") {
            config.cdc.publication_name = publication;
        }
        if let Some(secs) = env_parse::<u64>("PG_CDC_HEARTBEAT_INTERVAL_SECS")? {
            config.cdc.heartbeat_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| GatewayError::Configuration(format!("invalid value for {}: {}", key, raw))),
        Err(_) => Ok(None),
    }
}
