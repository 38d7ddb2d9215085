//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError, TenantConfig};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "ohana.toml",
    "./config/config.toml",
    "./config/ohana.toml",
    "/etc/ohana/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |key| env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("OHANA_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `OHANA_*` overrides using the given variable lookup.
pub(crate) fn apply_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Database
    if let Some(val) = lookup("OHANA_DATABASE_URL") {
        config.database.url = val;
    }
    if let Some(val) = lookup("OHANA_DATABASE_MIN_POOL_SIZE") {
        config.database.min_pool_size = parse_number("OHANA_DATABASE_MIN_POOL_SIZE", &val)?;
    }
    if let Some(val) = lookup("OHANA_DATABASE_MAX_POOL_SIZE") {
        config.database.max_pool_size = parse_number("OHANA_DATABASE_MAX_POOL_SIZE", &val)?;
    }

    // Redis
    if let Some(val) = lookup("OHANA_REDIS_URL") {
        config.redis.url = val;
    }
    if let Some(val) = lookup("OHANA_REDIS_MAX_POOL_SIZE") {
        config.redis.max_pool_size = parse_number("OHANA_REDIS_MAX_POOL_SIZE", &val)?;
    }

    // Broker
    if let Some(val) = lookup("OHANA_AMQP_URI") {
        config.broker.uri = val;
    }
    if let Some(val) = lookup("OHANA_AMQP_PREFETCH") {
        config.broker.prefetch_count = parse_number("OHANA_AMQP_PREFETCH", &val)?;
    }
    if let Some(val) = lookup("OHANA_AMQP_WORKERS") {
        config.broker.worker_concurrency = parse_number("OHANA_AMQP_WORKERS", &val)?;
    }

    // Broker admin API
    if let Some(val) = lookup("OHANA_BROKER_ADMIN_URL") {
        config.broker_admin.base_url = val;
    }
    if let Some(val) = lookup("OHANA_BROKER_ADMIN_USERNAME") {
        config.broker_admin.username = val;
    }
    if let Some(val) = lookup("OHANA_BROKER_ADMIN_PASSWORD") {
        config.broker_admin.password = val;
    }
    if let Some(val) = lookup("OHANA_BROKER_ADMIN_VHOST") {
        config.broker_admin.vhost = val;
    }

    // Federation
    if let Some(val) = lookup("OHANA_CLIENT_ID") {
        config.federation.client_id = val;
    }
    if let Some(val) = lookup("OHANA_FEDERATION_TENANTS") {
        config.federation.tenants = parse_tenants(&val)?;
    }

    // Pools
    if let Some(val) = lookup("OHANA_POOL_BORROW_TIMEOUT_MS") {
        config.pool.borrow_timeout_ms = parse_number("OHANA_POOL_BORROW_TIMEOUT_MS", &val)?;
    }

    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::EnvError(format!("{} is not a valid number: '{}'", key, value)))
}

/// Parse `id=connection_string` pairs separated by `;`.
fn parse_tenants(value: &str) -> Result<Vec<TenantConfig>, ConfigError> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, connection_string) = entry.split_once('=').ok_or_else(|| {
                ConfigError::EnvError(format!(
                    "OHANA_FEDERATION_TENANTS entry '{}' must look like id=amqp://...",
                    entry
                ))
            })?;
            Ok(TenantConfig {
                id: id.trim().to_string(),
                connection_string: connection_string.trim().to_string(),
            })
        })
        .collect()
}
