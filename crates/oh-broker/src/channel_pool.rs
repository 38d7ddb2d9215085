//! Broker channel pool adapter

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use lapin::options::ConfirmSelectOptions;
use oh_pool::{Pool, PoolError, PoolOptions, PoolRegistry, ResourceFactory};
use tracing::debug;

use crate::connection::{BrokerChannel, ConnectionManager};
use crate::Result;

pub const CHANNEL_POOL_PREFIX: &str = "rmq-";
pub const DEFAULT_CHANNEL_MIN_POOL_SIZE: usize = 1;
pub const DEFAULT_CHANNEL_MAX_POOL_SIZE: usize = 5;

/// Opens channels through the connection manager.
pub struct ChannelFactory {
    connections: Arc<ConnectionManager>,
    connection_name: String,
    uri: String,
    confirm: bool,
}

#[async_trait]
impl ResourceFactory for ChannelFactory {
    type Resource = BrokerChannel;

    async fn create(&self) -> oh_pool::Result<BrokerChannel> {
        let channel = self
            .connections
            .create_channel(&self.connection_name, &self.uri)
            .await
            .map_err(|e| PoolError::create(&self.connection_name, e.to_string()))?;

        if self.confirm {
            channel
                .channel()
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| PoolError::create(&self.connection_name, format!("confirm mode: {}", e)))?;
        }
        Ok(channel)
    }

    fn validate(&self, resource: &BrokerChannel) -> bool {
        resource.is_healthy()
    }

    async fn destroy(&self, resource: BrokerChannel) {
        resource.close().await;
    }
}

/// Settings for a channel pool; sizes default to 1/5.
#[derive(Debug, Clone)]
pub struct ChannelPoolConfig {
    pub name: String,
    pub connection_name: String,
    pub uri: String,
    /// Put every channel in publisher-confirm mode.
    pub confirm: bool,
    pub min_pool_size: Option<usize>,
    pub max_pool_size: Option<usize>,
    pub acquire_timeout: Option<Duration>,
}

impl ChannelPoolConfig {
    pub fn new(name: impl Into<String>, connection_name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_name: connection_name.into(),
            uri: uri.into(),
            confirm: false,
            min_pool_size: None,
            max_pool_size: None,
            acquire_timeout: None,
        }
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
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

    pub(crate) fn pool_options(&self) -> PoolOptions {
        let mut options = PoolOptions::new()
            .with_sizes(
                self.min_pool_size.unwrap_or(DEFAULT_CHANNEL_MIN_POOL_SIZE),
                self.max_pool_size.unwrap_or(DEFAULT_CHANNEL_MAX_POOL_SIZE),
            )
            .with_test_on_borrow(true);
        if let Some(timeout) = self.acquire_timeout {
            options = options.with_acquire_timeout(timeout);
        }
        options
    }
}

/// Handle to a registered channel pool.
#[derive(Clone, Debug)]
pub struct ChannelPool {
    pool: Pool<BrokerChannel>,
}

impl ChannelPool {
    pub fn create(
        registry: &PoolRegistry,
        connections: Arc<ConnectionManager>,
        config: &ChannelPoolConfig,
    ) -> Result<Self> {
        let factory = ChannelFactory {
            connections,
            connection_name: config.connection_name.clone(),
            uri: config.uri.clone(),
            confirm: config.confirm,
        };
        let name = format!("{}{}", CHANNEL_POOL_PREFIX, config.name);
        let pool = registry.create_pool(factory, &name, config.pool_options())?;
        Ok(Self { pool })
    }

    pub fn get(registry: &PoolRegistry, name: &str) -> Result<Self> {
        let pool = registry.get_pool(&format!("{}{}", CHANNEL_POOL_PREFIX, name))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<BrokerChannel> {
        &self.pool
    }

    /// Borrow a channel for one operation. A transport failure flags the
    /// channel so the pool replaces it; the error is returned after release.
    pub async fn with_channel<T, F>(&self, operation: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c BrokerChannel) -> BoxFuture<'c, Result<T>>,
    {
        let channel = self.pool.acquire().await?;
        let result = operation(&channel).await;
        if let Err(e) = &result {
            if e.is_transport() {
                debug!(pool = %self.pool.name(), error = %e, "Flagging channel after failure");
                channel.mark_unhealthy();
            }
        }
        drop(channel);
        result
    }
}
