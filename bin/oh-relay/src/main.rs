//! Ohana Broker Relay
//!
//! Declares the main topology, provisions federation for the configured
//! tenants and consumes the main queue until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use oh_broker::{
    AdminSettings, ChannelPoolConfig, ChatEventSink, ConsumerSettings, FederationSettings, InfraContext,
    MainTopology, WatchChatRouter,
};
use oh_config::{AppConfig, ConfigLoader};
use oh_pool::{CachePool, CachePoolConfig, DatabasePool, DatabasePoolConfig};
use serde_json::Value;
use tracing::{error, info, warn};

/// Logs chat events. Fan-out and push delivery live in downstream services.
struct LoggingChatSink;

#[async_trait::async_trait]
impl ChatEventSink for LoggingChatSink {
    async fn on_new_message(&self, chat: Value) -> oh_broker::Result<()> {
        info!(chat_id = %chat.get("id").unwrap_or(&serde_json::Value::Null), "Received chat message");
        Ok(())
    }

    async fn on_read_receipt(&self, receipt: Value) -> oh_broker::Result<()> {
        info!(chat_id = %receipt.get("chatId").unwrap_or(&serde_json::Value::Null), "Received read receipt");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    oh_common::logging::init_logging("oh-relay");

    info!("Starting Ohana broker relay");

    let config = ConfigLoader::new().load().context("failed to load configuration")?;
    let context = InfraContext::new(consumer_settings(&config));

    create_backend_pools(&context, &config).await?;

    let channels = context.channel_pool(
        &ChannelPoolConfig::new("infra", config.broker.infra_connection.clone(), config.broker.uri.clone())
            .with_confirm(true)
            .with_sizes(config.broker.channel_pool_min, config.broker.channel_pool_max)
            .with_acquire_timeout(borrow_timeout(&config)),
    )?;

    let topology = MainTopology::new(
        config.broker.main_exchange.clone(),
        config.broker.main_queue.clone(),
        config.broker.main_routing_key.clone(),
    );
    let declared = topology.clone();
    channels
        .with_channel(move |channel| Box::pin(async move { declared.declare(channel).await }))
        .await
        .context("failed to declare main topology")?;

    let federation = context.federation(&admin_settings(&config), federation_settings(&config))?;
    for tenant in &config.federation.tenants {
        // One tenant failing must not keep the others from being provisioned.
        if let Err(e) = federation
            .allocate_resources(&tenant.id, &tenant.connection_string)
            .await
        {
            error!(tenant = %tenant.id, error = %e, "Federation allocation failed");
        }
    }

    let router = Arc::new(WatchChatRouter::new(Arc::new(LoggingChatSink)));
    context
        .consumers()
        .register_consumer(&topology.queue, router)
        .await
        .context("failed to register main queue consumer")?;

    info!(queue = %topology.queue, tenants = config.federation.tenants.len(), "Relay running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    context.shutdown().await;
    info!("Relay stopped");
    Ok(())
}

fn borrow_timeout(config: &AppConfig) -> Duration {
    Duration::from_millis(config.pool.borrow_timeout_ms)
}

fn consumer_settings(config: &AppConfig) -> ConsumerSettings {
    ConsumerSettings {
        uri: config.broker.uri.clone(),
        connection_name: config.broker.consumer_connection.clone(),
        prefetch_count: config.broker.prefetch_count,
        worker_concurrency: config.broker.worker_concurrency,
    }
}

fn admin_settings(config: &AppConfig) -> AdminSettings {
    let admin = &config.broker_admin;
    AdminSettings {
        base_url: admin.base_url.clone(),
        username: admin.username.clone(),
        password: admin.password.clone(),
        vhost: admin.vhost.clone(),
        page_size: admin.page_size,
        timeout: Duration::from_millis(admin.timeout_ms),
        min_pool_size: admin.min_pool_size,
        max_pool_size: admin.max_pool_size,
    }
}

fn federation_settings(config: &AppConfig) -> FederationSettings {
    FederationSettings {
        client_id: config.federation.client_id.clone(),
        main_exchange: config.broker.main_exchange.clone(),
        upstream_prefetch_count: config.federation.upstream_prefetch_count,
        upstream_expires_ms: config.federation.upstream_expires_ms,
    }
}

/// Register the pools DAO code borrows from. Connections are opened lazily
/// and by the background warm-up; the cache is pinged once.
async fn create_backend_pools(context: &InfraContext, config: &AppConfig) -> anyhow::Result<()> {
    let registry = context.registry();

    if !config.database.url.is_empty() {
        DatabasePool::create(
            registry,
            &DatabasePoolConfig::new("main", config.database.url.clone())
                .with_sizes(config.database.min_pool_size, config.database.max_pool_size)
                .with_acquire_timeout(borrow_timeout(config)),
        )?;
    }

    if !config.redis.url.is_empty() {
        let cache = CachePool::create(
            registry,
            &CachePoolConfig::new("main", config.redis.url.clone())
                .with_sizes(config.redis.min_pool_size, config.redis.max_pool_size)
                .with_acquire_timeout(borrow_timeout(config)),
        )?;
        // Unreachable cache is not fatal; borrowers retry on demand.
        match cache.ping().await {
            Ok(()) => info!("Cache reachable"),
            Err(e) => warn!(error = %e, "Cache ping failed at startup"),
        }
    }

    info!(pools = ?registry.names(), "Backend pools registered");
    Ok(())
}
