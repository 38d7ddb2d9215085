//! Process-wide infrastructure state
//!
//! Owns the pool registry, the broker connection table and the consumer
//! registry. Built once at startup and shared by reference; nothing here is
//! a global.

use std::sync::Arc;

use oh_pool::PoolRegistry;
use tracing::info;

use crate::admin::{AdminSettings, BrokerAdminClient};
use crate::channel_pool::{ChannelPool, ChannelPoolConfig};
use crate::connection::ConnectionManager;
use crate::consumer::{ConsumerRegistry, ConsumerSettings};
use crate::federation::{FederationOrchestrator, FederationSettings};
use crate::Result;

pub struct InfraContext {
    registry: Arc<PoolRegistry>,
    connections: Arc<ConnectionManager>,
    consumers: ConsumerRegistry,
}

impl InfraContext {
    pub fn new(consumer_settings: ConsumerSettings) -> Self {
        let registry = Arc::new(PoolRegistry::new());
        let connections = Arc::new(ConnectionManager::new());
        let consumers = ConsumerRegistry::new(Arc::clone(&connections), consumer_settings);
        Self {
            registry,
            connections,
            consumers,
        }
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    pub fn channel_pool(&self, config: &ChannelPoolConfig) -> Result<ChannelPool> {
        ChannelPool::create(&self.registry, Arc::clone(&self.connections), config)
    }

    pub fn federation(
        &self,
        admin: &AdminSettings,
        settings: FederationSettings,
    ) -> Result<FederationOrchestrator> {
        let client = BrokerAdminClient::create(&self.registry, admin)?;
        Ok(FederationOrchestrator::new(Arc::new(client), settings))
    }

    /// Stop consumers, drain every pool, then close broker connections.
    /// Failures along the way are logged and shutdown continues.
    pub async fn shutdown(&self) {
        info!("Shutting down infrastructure");
        self.consumers.teardown_unprocessed_queued_messages().await;
        self.consumers.unregister_all().await;
        self.registry.drain_all().await;
        self.connections.release_all_connections().await;
        info!("Infrastructure shutdown complete");
    }
}
