//! Main exchange and queue declaration

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::ExchangeKind;
use tracing::info;

use crate::connection::BrokerChannel;
use crate::{BrokerError, Result};

pub const MAIN_EXCHANGE: &str = "csa-watchChat";
pub const MAIN_QUEUE: &str = "ohana.csa-watchChat";
pub const MAIN_ROUTING_KEY: &str = "#";

/// The exchange every tenant exchange is bound into, and the quorum queue
/// the consumer reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainTopology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Default for MainTopology {
    fn default() -> Self {
        Self::new(MAIN_EXCHANGE, MAIN_QUEUE, MAIN_ROUTING_KEY)
    }
}

impl MainTopology {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Declare the durable topic exchange, the quorum queue, and the binding
    /// between them. Redeclaring with identical settings is a no-op.
    pub async fn declare(&self, channel: &BrokerChannel) -> Result<()> {
        let amqp = channel.channel();

        amqp.exchange_declare(
            &self.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Channel(format!("Failed to declare exchange '{}': {}", self.exchange, e)))?;

        amqp.queue_declare(
            &self.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            quorum_arguments(),
        )
        .await
        .map_err(|e| BrokerError::Channel(format!("Failed to declare queue '{}': {}", self.queue, e)))?;

        amqp.queue_bind(
            &self.queue,
            &self.exchange,
            &self.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Channel(format!("Failed to bind queue '{}': {}", self.queue, e)))?;

        info!(
            exchange = %self.exchange,
            queue = %self.queue,
            routing_key = %self.routing_key,
            "Declared main topology"
        );
        Ok(())
    }
}

fn quorum_arguments() -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
    arguments
}
