//! Dispatch and Scheduler Tests
//!
//! Tests for:
//! - Routing by topic suffix
//! - Ack-always on success, handler error, parse error and panic
//! - Arrival-order scheduling with bounded workers
//! - Teardown of unstarted messages

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use oh_broker::{
    dispatch, Acknowledger, BrokerError, ChatEventSink, DispatchOutcome, InboundMessage, MessageHandler,
    MessageScheduler, WatchChatRouter,
};

/// Counts acknowledgments.
#[derive(Clone, Default)]
struct CountingAcker {
    acks: Arc<AtomicU32>,
}

impl CountingAcker {
    fn count(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Acknowledger for CountingAcker {
    async fn ack(&self) -> oh_broker::Result<()> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records chat events.
#[derive(Default)]
struct RecordingSink {
    chats: parking_lot::Mutex<Vec<Value>>,
    receipts: parking_lot::Mutex<Vec<Value>>,
    fail: bool,
}

#[async_trait]
impl ChatEventSink for RecordingSink {
    async fn on_new_message(&self, chat: Value) -> oh_broker::Result<()> {
        self.chats.lock().push(chat);
        if self.fail {
            return Err(BrokerError::Dispatch("database unavailable".to_string()));
        }
        Ok(())
    }

    async fn on_read_receipt(&self, receipt: Value) -> oh_broker::Result<()> {
        self.receipts.lock().push(receipt);
        Ok(())
    }
}

struct PanickingHandler;

#[async_trait]
impl MessageHandler for PanickingHandler {
    async fn handle(&self, _message: &InboundMessage) -> oh_broker::Result<()> {
        panic!("handler bug");
    }
}

/// Blocks every call until released; records the order calls start in.
struct GatedHandler {
    gate: Notify,
    started: parking_lot::Mutex<Vec<String>>,
    completed: AtomicU32,
}

impl GatedHandler {
    fn new() -> Self {
        Self {
            gate: Notify::new(),
            started: parking_lot::Mutex::new(Vec::new()),
            completed: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl MessageHandler for GatedHandler {
    async fn handle(&self, message: &InboundMessage) -> oh_broker::Result<()> {
        self.started.lock().push(message.routing_key.clone());
        self.gate.notified().await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records start order without blocking.
#[derive(Default)]
struct OrderHandler {
    seen: parking_lot::Mutex<Vec<String>>,
}

#[async_trait]
impl MessageHandler for OrderHandler {
    async fn handle(&self, message: &InboundMessage) -> oh_broker::Result<()> {
        self.seen.lock().push(message.routing_key.clone());
        Ok(())
    }
}

fn message(routing_key: &str, body: &[u8]) -> InboundMessage {
    InboundMessage::new("ohana.csa-watchChat", routing_key, body.to_vec())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_watch_channel_routed_then_acked() {
    let sink = Arc::new(RecordingSink::default());
    let router = WatchChatRouter::new(sink.clone());
    let acker = CountingAcker::default();
    let body = json!({"data": {"watchChannel": {"chat": {"id": "c1", "text": "hello"}}}});

    let outcome = dispatch(
        &router,
        &message("tenant.gql.client.watchChannel", body.to_string().as_bytes()),
        &acker,
    )
    .await;

    assert_eq!(outcome, DispatchOutcome::Handled);
    assert_eq!(sink.chats.lock().len(), 1);
    assert_eq!(sink.chats.lock()[0]["id"], "c1");
    assert!(sink.receipts.lock().is_empty());
    assert_eq!(acker.count(), 1);
}

#[tokio::test]
async fn test_read_receipt_routed() {
    let sink = Arc::new(RecordingSink::default());
    let router = WatchChatRouter::new(sink.clone());
    let acker = CountingAcker::default();
    let body = json!({"data": {"watchReadReceipt": {"readReceipt": {"chatId": "c1", "userId": "u9"}}}});

    dispatch(
        &router,
        &message("tenant.gql.client.watchReadReceipt", body.to_string().as_bytes()),
        &acker,
    )
    .await;

    assert_eq!(sink.receipts.lock()[0]["userId"], "u9");
    assert!(sink.chats.lock().is_empty());
    assert_eq!(acker.count(), 1);
}

#[tokio::test]
async fn test_unparseable_content_still_acked() {
    let sink = Arc::new(RecordingSink::default());
    let router = WatchChatRouter::new(sink.clone());
    let acker = CountingAcker::default();

    let outcome = dispatch(&router, &message("tenant.gql.client.watchChannel", b"{not json"), &acker).await;

    assert_eq!(outcome, DispatchOutcome::Failed);
    assert!(sink.chats.lock().is_empty());
    assert!(sink.receipts.lock().is_empty());
    assert_eq!(acker.count(), 1);
}

#[tokio::test]
async fn test_unknown_suffix_dropped_and_acked() {
    let sink = Arc::new(RecordingSink::default());
    let router = WatchChatRouter::new(sink.clone());
    let acker = CountingAcker::default();

    let outcome = dispatch(&router, &message("tenant.gql.client.watchPresence", b"{}"), &acker).await;

    assert_eq!(outcome, DispatchOutcome::Handled);
    assert!(sink.chats.lock().is_empty());
    assert_eq!(acker.count(), 1);
}

#[tokio::test]
async fn test_unknown_suffix_body_is_not_parsed() {
    let sink = Arc::new(RecordingSink::default());
    let router = WatchChatRouter::new(sink.clone());
    let acker = CountingAcker::default();

    let outcome = dispatch(&router, &message("tenant.gql.client.watchPresence", b"{not json"), &acker).await;

    assert_eq!(outcome, DispatchOutcome::Handled);
    assert!(sink.chats.lock().is_empty());
    assert!(sink.receipts.lock().is_empty());
    assert_eq!(acker.count(), 1);
}

#[tokio::test]
async fn test_handler_error_still_acked_once() {
    let sink = Arc::new(RecordingSink {
        fail: true,
        ..Default::default()
    });
    let router = WatchChatRouter::new(sink.clone());
    let acker = CountingAcker::default();
    let body = json!({"data": {"watchChannel": {"chat": {"id": "c2"}}}});

    let outcome = dispatch(
        &router,
        &message("t.gql.c.watchChannel", body.to_string().as_bytes()),
        &acker,
    )
    .await;

    assert_eq!(outcome, DispatchOutcome::Failed);
    assert_eq!(sink.chats.lock().len(), 1);
    assert_eq!(acker.count(), 1);
}

#[tokio::test]
async fn test_missing_chat_field_is_failure() {
    let sink = Arc::new(RecordingSink::default());
    let router = WatchChatRouter::new(sink.clone());
    let acker = CountingAcker::default();

    let outcome = dispatch(&router, &message("t.gql.c.watchChannel", br#"{"data":{}}"#), &acker).await;

    assert_eq!(outcome, DispatchOutcome::Failed);
    assert!(sink.chats.lock().is_empty());
    assert_eq!(acker.count(), 1);
}

#[tokio::test]
async fn test_panicking_handler_still_acked() {
    let acker = CountingAcker::default();

    let outcome = dispatch(&PanickingHandler, &message("t.gql.c.watchChannel", b"{}"), &acker).await;

    assert_eq!(outcome, DispatchOutcome::Panicked);
    assert_eq!(acker.count(), 1);
}

#[tokio::test]
async fn test_scheduler_starts_in_arrival_order() {
    let handler = Arc::new(OrderHandler::default());
    let scheduler = MessageScheduler::start("orders", handler.clone(), 1);
    let acker = CountingAcker::default();

    for i in 0..10 {
        assert!(scheduler.schedule(message(&format!("m.{}", i), b"{}"), Box::new(acker.clone())));
    }
    wait_until(|| acker.count() == 10).await;

    let expected: Vec<String> = (0..10).map(|i| format!("m.{}", i)).collect();
    assert_eq!(*handler.seen.lock(), expected);
    assert_eq!(scheduler.pending(), 0);
}

#[tokio::test]
async fn test_slow_handler_does_not_block_others() {
    let gated = Arc::new(GatedHandler::new());
    let scheduler = MessageScheduler::start("slow", gated.clone(), 4);
    let acker = CountingAcker::default();

    scheduler.schedule(message("a", b"{}"), Box::new(acker.clone()));
    scheduler.schedule(message("b", b"{}"), Box::new(acker.clone()));
    wait_until(|| gated.started.lock().len() == 2).await;

    gated.gate.notify_waiters();
    wait_until(|| acker.count() == 2).await;
    assert_eq!(gated.completed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_teardown_drops_unstarted_messages() {
    let gated = Arc::new(GatedHandler::new());
    let scheduler = MessageScheduler::start("teardown", gated.clone(), 1);
    let acker = CountingAcker::default();

    for key in ["first", "second", "third"] {
        scheduler.schedule(message(key, b"{}"), Box::new(acker.clone()));
    }
    wait_until(|| gated.started.lock().len() == 1).await;
    assert_eq!(scheduler.pending(), 2);

    scheduler.cancel();
    assert!(!scheduler.schedule(message("late", b"{}"), Box::new(acker.clone())));
    wait_until(|| scheduler.pending() == 0).await;

    // The in-flight handler still completes and is acknowledged.
    gated.gate.notify_one();
    scheduler.shutdown().await;

    assert_eq!(*gated.started.lock(), vec!["first".to_string()]);
    assert_eq!(gated.completed.load(Ordering::SeqCst), 1);
    assert_eq!(acker.count(), 1);
}
