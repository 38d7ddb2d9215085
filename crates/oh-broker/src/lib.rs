//! Ohana Broker Infrastructure
//!
//! This crate provides everything that talks to the message broker:
//! - ConnectionManager: one AMQP connection per logical name, health-flagged channels
//! - ChannelPool: pooled channels (`rmq-` prefix) on top of the connection manager
//! - BrokerAdminClient: management API operations over a pooled HTTP client
//! - FederationOrchestrator: idempotent per-tenant federation topology
//! - ConsumerRegistry: consumer loop with ordered, bounded dispatch and ack-always
//! - InfraContext: owner of the registries for the life of the process

pub mod admin;
pub mod channel_pool;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod federation;
pub mod publisher;
pub mod topology;

pub use admin::{
    AdminSettings, BindingDefinition, BindingInfo, BrokerAdmin, BrokerAdminClient, ExchangeDefinition,
    ExchangeInfo, ExchangeKind, FederationUpstreamInfo, PolicyDefinition, PolicyInfo, UpstreamDefinition,
};
pub use channel_pool::{ChannelPool, ChannelPoolConfig};
pub use connection::{BrokerChannel, ConnectionManager};
pub use consumer::{ConsumerRegistry, ConsumerSettings, MessageScheduler};
pub use context::InfraContext;
pub use dispatch::{
    dispatch, Acknowledger, ChatEventSink, DispatchOutcome, InboundMessage, MessageHandler, TopicSuffix,
    WatchChatRouter,
};
pub use error::BrokerError;
pub use federation::{FederationOrchestrator, FederationSettings, TenantTopology};
pub use publisher::ConfirmPublisher;
pub use topology::MainTopology;

pub type Result<T> = std::result::Result<T, BrokerError>;
