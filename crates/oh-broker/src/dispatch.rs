//! Message dispatch: handler traits, topic-suffix routing and the ack-always
//! wrapper used by the consumer loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::BasicAckOptions;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{BrokerError, Result};

/// A delivery detached from its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
}

impl InboundMessage {
    pub fn new(queue: impl Into<String>, routing_key: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            queue: queue.into(),
            exchange: String::new(),
            routing_key: routing_key.into(),
            delivery_tag: 0,
            redelivered: false,
            data: data.into(),
        }
    }

    pub(crate) fn from_delivery(queue: &str, delivery: &Delivery) -> Self {
        Self {
            queue: queue.to_string(),
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            data: delivery.data.clone(),
        }
    }

    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Acknowledges one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// Acknowledger backed by the AMQP delivery's acker.
pub struct DeliveryAcker(pub Acker);

#[async_trait]
impl Acknowledger for DeliveryAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("ACK failed: {}", e)))
    }
}

/// Processes one inbound message. Acknowledgment is done by the caller.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &InboundMessage) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Failed,
    Panicked,
}

/// Run the handler, then acknowledge exactly once whatever the handler did.
///
/// Handler errors and panics are logged and swallowed. A failed ack is
/// logged too; the broker redelivers once the channel closes.
pub async fn dispatch(
    handler: &dyn MessageHandler,
    message: &InboundMessage,
    acker: &dyn Acknowledger,
) -> DispatchOutcome {
    let outcome = match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(Ok(())) => DispatchOutcome::Handled,
        Ok(Err(e)) => {
            error!(
                queue = %message.queue,
                routing_key = %message.routing_key,
                delivery_tag = message.delivery_tag,
                error = %e,
                "Message handler failed"
            );
            DispatchOutcome::Failed
        }
        Err(_) => {
            error!(
                queue = %message.queue,
                routing_key = %message.routing_key,
                delivery_tag = message.delivery_tag,
                "Message handler panicked"
            );
            DispatchOutcome::Panicked
        }
    };

    if let Err(e) = acker.ack().await {
        warn!(queue = %message.queue, delivery_tag = message.delivery_tag, error = %e, "Failed to acknowledge message");
    }
    outcome
}

// ============================================================================
// Watch-chat routing
// ============================================================================

/// Known routing-key suffixes (last dot-delimited segment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSuffix {
    WatchChannel,
    WatchReadReceipt,
    Unknown(String),
}

impl TopicSuffix {
    pub fn from_routing_key(routing_key: &str) -> Self {
        let suffix = routing_key.rsplit('.').next().unwrap_or_default();
        match suffix {
            "watchChannel" => TopicSuffix::WatchChannel,
            "watchReadReceipt" => TopicSuffix::WatchReadReceipt,
            other => TopicSuffix::Unknown(other.to_string()),
        }
    }
}

/// Receives decoded chat events.
#[async_trait]
pub trait ChatEventSink: Send + Sync + 'static {
    async fn on_new_message(&self, chat: Value) -> Result<()>;
    async fn on_read_receipt(&self, receipt: Value) -> Result<()>;
}

/// Routes main-queue messages by topic suffix to a [`ChatEventSink`].
pub struct WatchChatRouter {
    sink: Arc<dyn ChatEventSink>,
}

impl WatchChatRouter {
    pub fn new(sink: Arc<dyn ChatEventSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageHandler for WatchChatRouter {
    async fn handle(&self, message: &InboundMessage) -> Result<()> {
        let suffix = TopicSuffix::from_routing_key(&message.routing_key);
        // Unknown topics are dropped unread; only routed bodies are parsed.
        if let TopicSuffix::Unknown(other) = &suffix {
            warn!(routing_key = %message.routing_key, suffix = %other, "Dropping message with unknown topic");
            return Ok(());
        }

        let body = message.json()?;
        match suffix {
            TopicSuffix::WatchChannel => {
                let chat = field(&body, "/data/watchChannel/chat")?;
                debug!(routing_key = %message.routing_key, "Routing new chat message");
                self.sink.on_new_message(chat).await
            }
            TopicSuffix::WatchReadReceipt => {
                let receipt = field(&body, "/data/watchReadReceipt/readReceipt")?;
                debug!(routing_key = %message.routing_key, "Routing read receipt");
                self.sink.on_read_receipt(receipt).await
            }
            TopicSuffix::Unknown(_) => Ok(()),
        }
    }
}

fn field(body: &Value, pointer: &str) -> Result<Value> {
    body.pointer(pointer)
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| BrokerError::Dispatch(format!("message has no '{}'", pointer)))
}
