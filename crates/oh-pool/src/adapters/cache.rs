//! Redis pool adapter

use std::time::Duration;

use async_trait::async_trait;
use oh_common::HealthFlag;
use redis::aio::MultiplexedConnection;
use redis::{Cmd, FromRedisValue, RedisError};
use tracing::warn;

use crate::factory::ResourceFactory;
use crate::options::PoolOptions;
use crate::pool::Pool;
use crate::registry::PoolRegistry;
use crate::{PoolError, Result};

pub const CACHE_POOL_PREFIX: &str = "redis-";
pub const DEFAULT_CACHE_MIN_POOL_SIZE: usize = 1;
pub const DEFAULT_CACHE_MAX_POOL_SIZE: usize = 10;

/// A pooled Redis connection with its health flag.
pub struct CacheConnection {
    conn: MultiplexedConnection,
    health: HealthFlag,
}

impl CacheConnection {
    pub fn health(&self) -> &HealthFlag {
        &self.health
    }

    pub async fn execute<T: FromRedisValue>(&mut self, cmd: &Cmd) -> Result<T> {
        let result = cmd.query_async::<T>(&mut self.conn).await;
        result.map_err(|e| {
            if is_transport_error(&e) {
                warn!(error = %e, "Redis connection failed, marking unhealthy");
                self.health.mark_unhealthy();
            }
            PoolError::Redis(e)
        })
    }
}

fn is_transport_error(error: &RedisError) -> bool {
    error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal()
}

/// Opens multiplexed Redis connections for a pool.
pub struct CacheFactory {
    client: redis::Client,
}

impl CacheFactory {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| PoolError::Config(format!("invalid redis url: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResourceFactory for CacheFactory {
    type Resource = CacheConnection;

    async fn create(&self) -> Result<CacheConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(CacheConnection {
            conn,
            health: HealthFlag::new(),
        })
    }

    fn validate(&self, resource: &CacheConnection) -> bool {
        resource.health.is_healthy()
    }

    async fn destroy(&self, resource: CacheConnection) {
        // Dropping the multiplexed handle closes the socket.
        drop(resource);
    }
}

#[derive(Debug, Clone)]
pub struct CachePoolConfig {
    pub name: String,
    pub url: String,
    pub min_pool_size: Option<usize>,
    pub max_pool_size: Option<usize>,
    pub acquire_timeout: Option<Duration>,
}

impl CachePoolConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            min_pool_size: None,
            max_pool_size: None,
            acquire_timeout: None,
        }
    }

    pub fn with_sizes(mut self, min: usize, max: usize) -> Self {
        self.min_pool_size = Some(min);
        self.max_pool_size = Some(max);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    fn pool_options(&self) -> PoolOptions {
        let mut options = PoolOptions::new()
            .with_sizes(
                self.min_pool_size.unwrap_or(DEFAULT_CACHE_MIN_POOL_SIZE),
                self.max_pool_size.unwrap_or(DEFAULT_CACHE_MAX_POOL_SIZE),
            )
            .with_test_on_borrow(true);
        if let Some(timeout) = self.acquire_timeout {
            options = options.with_acquire_timeout(timeout);
        }
        options
    }
}

/// Handle to a registered Redis pool.
#[derive(Clone, Debug)]
pub struct CachePool {
    pool: Pool<CacheConnection>,
}

impl CachePool {
    pub fn create(registry: &PoolRegistry, config: &CachePoolConfig) -> Result<Self> {
        let name = format!("{}{}", CACHE_POOL_PREFIX, config.name);
        let pool = registry.create_pool(CacheFactory::new(&config.url)?, &name, config.pool_options())?;
        Ok(Self { pool })
    }

    pub fn get(registry: &PoolRegistry, name: &str) -> Result<Self> {
        let pool = registry.get_pool(&format!("{}{}", CACHE_POOL_PREFIX, name))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<CacheConnection> {
        &self.pool
    }

    /// Borrow, run one command, release.
    pub async fn execute<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.execute(cmd).await;
        drop(conn);
        result
    }

    pub async fn ping(&self) -> Result<()> {
        let reply: String = self.execute(&redis::cmd("PING")).await?;
        if reply.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(PoolError::Operation(format!("unexpected PING reply: {}", reply)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_config_error() {
        assert!(matches!(CacheFactory::new("not a url"), Err(PoolError::Config(_))));
    }

    #[test]
    fn test_default_sizes() {
        let options = CachePoolConfig::new("sessions", "redis://localhost").pool_options();
        assert_eq!(options.min_size, 1);
        assert_eq!(options.max_size, 10);
    }

    #[tokio::test]
    async fn test_ping_unreachable_server_fails_and_frees_slot() {
        let registry = PoolRegistry::new();
        let config = CachePoolConfig::new("offline", "redis://127.0.0.1:1")
            .with_sizes(0, 1)
            .with_acquire_timeout(Duration::from_secs(2));
        let cache = CachePool::create(&registry, &config).unwrap();

        assert!(cache.ping().await.is_err());
        assert_eq!(cache.pool().status().size, 0);
    }

    #[test]
    fn test_registry_prefix() {
        let registry = PoolRegistry::new();
        let config = CachePoolConfig::new("sessions", "redis://localhost:6379").with_sizes(0, 2);
        CachePool::create(&registry, &config).unwrap();
        assert!(registry.contains("redis-sessions"));
        assert!(CachePool::get(&registry, "sessions").is_ok());
    }
}
