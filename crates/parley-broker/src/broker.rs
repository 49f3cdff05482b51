//! The broker: per-connection lifecycle and frame dispatch.
//!
//! Owns the connection registry and subscription index behind a single
//! lock so the two can never be observed out of step. Transport I/O
//! happens outside the lock through each connection's outbound queue.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::envelope::{ChatRecord, InboundChat, OutboundChat};
use crate::frame::{Command, Frame};
use crate::index::SubscriptionIndex;
use crate::registry::{ConnectionId, ConnectionRegistry, OutboundSender};
use crate::router::DestinationRouter;
use crate::storage::ChatStore;

/// Protocol version advertised in the CONNECTED handshake.
pub const STOMP_VERSION: &str = "1.2";

/// Heartbeat pair advertised in the CONNECTED handshake. Advertised
/// only; the broker neither sends pings nor disconnects silent peers.
pub const HEARTBEAT_ADVERTISED: &str = "10000,10000";

#[derive(Debug, Default)]
struct BrokerState {
    registry: ConnectionRegistry,
    index: SubscriptionIndex,
}

/// A single broker instance. Construct one per endpoint; instances do
/// not share state.
pub struct Broker {
    state: Mutex<BrokerState>,
    router: DestinationRouter,
    store: Arc<dyn ChatStore>,
}

impl Broker {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            router: DestinationRouter::new(),
            store,
        }
    }

    /// Register a new connection and immediately send the CONNECTED
    /// handshake. No client frame is required first.
    pub async fn connect(&self, sender: OutboundSender) -> ConnectionId {
        let mut state = self.state.lock().await;
        let id = state.registry.register(sender);

        let handshake = Frame::new(Command::Connected)
            .with_header("version", STOMP_VERSION)
            .with_header("heart-beat", HEARTBEAT_ADVERTISED);
        if let Some(entry) = state.registry.get(id) {
            entry.send(&handshake);
        }

        info!(connection = id, "connection opened");
        id
    }

    /// Tear down a connection: remove it from every channel it was
    /// subscribed to, then drop its registry entry. Safe to call again
    /// for an already-closed connection.
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut state = self.state.lock().await;
        let channels = state.registry.take_subscriptions(id);
        state.index.remove_connection_everywhere(id, &channels);
        if state.registry.unregister(id).is_some() {
            info!(connection = id, "connection closed");
        }
    }

    /// Process one inbound text message from a connection. Malformed or
    /// unroutable frames degrade that interaction only; the connection
    /// stays open.
    pub async fn handle_frame(&self, id: ConnectionId, raw: &str) {
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection = id, error = %err, "dropping malformed frame");
                return;
            }
        };

        match frame.command {
            // Handshake already went out on connect.
            Command::Connect | Command::Stomp => {
                debug!(connection = id, "client handshake frame ignored");
            }
            Command::Subscribe => self.handle_subscribe(id, &frame).await,
            Command::Unsubscribe => self.handle_unsubscribe(id, &frame).await,
            Command::Send => self.handle_send(id, &frame).await,
            Command::Disconnect => self.handle_disconnect(id).await,
            other => {
                debug!(
                    connection = id,
                    command = other.as_str(),
                    "ignoring server-only command from client"
                );
            }
        }
    }

    async fn handle_subscribe(&self, id: ConnectionId, frame: &Frame) {
        let Some(channel) = self.resolve_destination(id, frame) else {
            return;
        };

        let mut state = self.state.lock().await;
        if !state.registry.contains(id) {
            debug!(connection = id, "SUBSCRIBE from unregistered connection");
            return;
        }
        // Registry and index are updated in the same critical section.
        state.registry.add_subscription(id, &channel);
        state.index.subscribe(&channel, id);
        debug!(connection = id, channel = %channel, "subscribed");

        if let Some(receipt) = frame.header("receipt") {
            let receipt_frame =
                Frame::new(Command::Receipt).with_header("receipt-id", receipt);
            if let Some(entry) = state.registry.get(id) {
                entry.send(&receipt_frame);
            }
        }
    }

    async fn handle_unsubscribe(&self, id: ConnectionId, frame: &Frame) {
        let Some(channel) = self.resolve_destination(id, frame) else {
            return;
        };

        let mut state = self.state.lock().await;
        if state.registry.remove_subscription(id, &channel) {
            state.index.unsubscribe(&channel, id);
            debug!(connection = id, channel = %channel, "unsubscribed");
        }
    }

    async fn handle_send(&self, id: ConnectionId, frame: &Frame) {
        let Some(channel) = self.resolve_destination(id, frame) else {
            return;
        };

        let inbound: InboundChat = match serde_json::from_str(&frame.body) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(
                    connection = id,
                    channel = %channel,
                    error = %err,
                    "dropping SEND with malformed body"
                );
                return;
            }
        };

        let outbound = OutboundChat::from_inbound(inbound, &channel);
        self.persist(ChatRecord {
            channel: channel.clone(),
            user_id: outbound.user_id,
            content: outbound.content.clone(),
            created_at: outbound.timestamp,
        });

        let body = match serde_json::to_string(&outbound) {
            Ok(body) => body,
            Err(err) => {
                warn!(channel = %channel, error = %err, "failed to serialize broadcast body");
                return;
            }
        };
        let message = Frame::new(Command::Message)
            .with_header("destination", DestinationRouter::topic_for(&channel))
            .with_header("content-type", "application/json")
            .with_header("message-id", &outbound.id)
            .with_body(body);

        let state = self.state.lock().await;
        let mut delivered = 0usize;
        for subscriber in state.index.subscribers_of(&channel) {
            let Some(entry) = state.registry.get(subscriber) else {
                continue;
            };
            if entry.send(&message) {
                delivered += 1;
            } else {
                // Transport already gone; cleanup runs on its close path.
                debug!(connection = subscriber, "skipped closed subscriber");
            }
        }
        debug!(channel = %channel, delivered, "message fanned out");
    }

    /// DISCONNECT closes the transport; cleanup then runs through the
    /// same close path as an unexpected drop.
    async fn handle_disconnect(&self, id: ConnectionId) {
        let state = self.state.lock().await;
        if let Some(entry) = state.registry.get(id) {
            entry.close();
        }
    }

    /// Submit a record to the persistence sink without blocking
    /// broadcast. Failures are logged and otherwise ignored.
    fn persist(&self, record: ChatRecord) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.insert_message(record).await {
                warn!(error = %err, "failed to persist chat message");
            }
        });
    }

    fn resolve_destination(&self, id: ConnectionId, frame: &Frame) -> Option<String> {
        let Some(destination) = frame.header("destination") else {
            warn!(
                connection = id,
                command = frame.command.as_str(),
                "frame without destination header"
            );
            return None;
        };
        let resolved = self.router.resolve(destination);
        if resolved.is_none() {
            warn!(connection = id, destination, "unroutable destination");
        }
        resolved
    }

    /// Channels a connection is currently subscribed to.
    pub async fn subscriptions_of(&self, id: ConnectionId) -> HashSet<String> {
        self.state
            .lock()
            .await
            .registry
            .subscriptions_of(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Connections currently subscribed to a channel.
    pub async fn subscribers_of(&self, channel: &str) -> Vec<ConnectionId> {
        self.state.lock().await.index.subscribers_of(channel)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.registry.len()
    }

    pub async fn channel_count(&self) -> usize {
        self.state.lock().await.index.channel_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use crate::storage::MemoryChatStore;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn broker() -> (Arc<Broker>, Arc<MemoryChatStore>) {
        let store = Arc::new(MemoryChatStore::new());
        (Arc::new(Broker::new(store.clone())), store)
    }

    /// Open a connection and consume the CONNECTED handshake.
    async fn open(broker: &Broker) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = broker.connect(tx).await;
        match rx.recv().await {
            Some(Outbound::Frame(wire)) => {
                let frame = Frame::decode(&wire).unwrap();
                assert_eq!(frame.command, Command::Connected);
            }
            other => panic!("expected CONNECTED handshake, got {other:?}"),
        }
        (id, rx)
    }

    fn subscribe_frame(destination: &str) -> String {
        Frame::new(Command::Subscribe)
            .with_header("destination", destination)
            .encode()
    }

    fn send_frame(destination: &str, body: &str) -> String {
        Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_body(body)
            .encode()
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<Frame> {
        match rx.try_recv() {
            Ok(Outbound::Frame(wire)) => Some(Frame::decode(&wire).unwrap()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_handshake_advertises_version_and_heartbeat() {
        let (broker, _) = broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.connect(tx).await;

        let Some(Outbound::Frame(wire)) = rx.recv().await else {
            panic!("no handshake");
        };
        let frame = Frame::decode(&wire).unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.header("version"), Some(STOMP_VERSION));
        assert_eq!(frame.header("heart-beat"), Some(HEARTBEAT_ADVERTISED));
    }

    #[tokio::test]
    async fn test_subscribe_keeps_registry_and_index_symmetric() {
        let (broker, _) = broker();
        let (id, _rx) = open(&broker).await;

        broker.handle_frame(id, &subscribe_frame("/topic/chat/42")).await;
        assert!(broker.subscriptions_of(id).await.contains("42"));
        assert_eq!(broker.subscribers_of("42").await, vec![id]);

        broker
            .handle_frame(
                id,
                &Frame::new(Command::Unsubscribe)
                    .with_header("destination", "/topic/chat/42")
                    .encode(),
            )
            .await;
        assert!(!broker.subscriptions_of(id).await.contains("42"));
        assert!(broker.subscribers_of("42").await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_prunes_empty_channels() {
        let (broker, _) = broker();
        let (id, _rx) = open(&broker).await;

        broker.handle_frame(id, &subscribe_frame("/topic/chat/42")).await;
        assert_eq!(broker.channel_count().await, 1);

        broker.disconnect(id).await;
        assert_eq!(broker.channel_count().await, 0);
        assert_eq!(broker.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_only_channel_subscribers() {
        let (broker, _) = broker();
        let (a, mut rx_a) = open(&broker).await;
        let (b, mut rx_b) = open(&broker).await;
        let (c, mut rx_c) = open(&broker).await;

        broker.handle_frame(a, &subscribe_frame("/topic/chat/42")).await;
        broker.handle_frame(b, &subscribe_frame("/topic/chat/42")).await;
        broker.handle_frame(c, &subscribe_frame("/topic/chat/7")).await;

        broker
            .handle_frame(a, &send_frame("/app/chat/42", r#"{"content":"hi","userId":7}"#))
            .await;

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = next_frame(rx).expect("subscriber should receive one copy");
            assert_eq!(frame.command, Command::Message);
            assert_eq!(frame.header("destination"), Some("/topic/chat/42"));
            assert_eq!(frame.header("content-type"), Some("application/json"));
            assert!(frame.header("message-id").is_some());

            let body: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
            assert_eq!(body["content"], "hi");
            assert_eq!(body["userId"], 7);

            // Exactly one copy.
            assert!(next_frame(rx).is_none());
        }
        assert!(next_frame(&mut rx_c).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_delivers_one_copy() {
        let (broker, _) = broker();
        let (a, mut rx_a) = open(&broker).await;
        let (b, _rx_b) = open(&broker).await;

        broker.handle_frame(a, &subscribe_frame("/topic/chat/42")).await;
        broker.handle_frame(a, &subscribe_frame("/topic/chat/42")).await;
        broker
            .handle_frame(b, &send_frame("/app/chat/42", r#"{"content":"hi"}"#))
            .await;

        assert!(next_frame(&mut rx_a).is_some());
        assert!(next_frame(&mut rx_a).is_none());
    }

    #[tokio::test]
    async fn test_subscribe_with_receipt_is_echoed_to_sender_only() {
        let (broker, _) = broker();
        let (a, mut rx_a) = open(&broker).await;
        let (_b, mut rx_b) = open(&broker).await;

        broker
            .handle_frame(
                a,
                &Frame::new(Command::Subscribe)
                    .with_header("destination", "/topic/chat/42")
                    .with_header("receipt", "sub-1")
                    .encode(),
            )
            .await;

        let receipt = next_frame(&mut rx_a).expect("receipt expected");
        assert_eq!(receipt.command, Command::Receipt);
        assert_eq!(receipt.header("receipt-id"), Some("sub-1"));
        assert!(next_frame(&mut rx_b).is_none());
    }

    #[tokio::test]
    async fn test_disconnect_removes_connection_from_every_channel() {
        let (broker, _) = broker();
        let (a, _rx_a) = open(&broker).await;
        let (b, _rx_b) = open(&broker).await;

        for room in ["1", "2", "3"] {
            broker
                .handle_frame(a, &subscribe_frame(&format!("/topic/chat/{room}")))
                .await;
        }
        broker.handle_frame(b, &subscribe_frame("/topic/chat/2")).await;

        broker.disconnect(a).await;

        for room in ["1", "2", "3"] {
            assert!(!broker.subscribers_of(room).await.contains(&a));
        }
        // "2" still has b; "1" and "3" are gone entirely.
        assert_eq!(broker.subscribers_of("2").await, vec![b]);
        assert_eq!(broker.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_a_no_op() {
        let (broker, _) = broker();
        let (id, _rx) = open(&broker).await;
        broker.handle_frame(id, &subscribe_frame("/topic/chat/1")).await;

        broker.disconnect(id).await;
        broker.disconnect(id).await;

        assert_eq!(broker.connection_count().await, 0);
        assert_eq!(broker.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_send_body_is_dropped_entirely() {
        let (broker, store) = broker();
        let (a, _rx_a) = open(&broker).await;
        let (b, mut rx_b) = open(&broker).await;
        broker.handle_frame(b, &subscribe_frame("/topic/chat/42")).await;

        broker.handle_frame(a, &send_frame("/app/chat/42", "not json")).await;

        assert!(next_frame(&mut rx_b).is_none());
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_unroutable_send_is_dropped() {
        let (broker, store) = broker();
        let (a, _rx_a) = open(&broker).await;
        let (b, mut rx_b) = open(&broker).await;
        broker.handle_frame(b, &subscribe_frame("/topic/chat/42")).await;

        broker
            .handle_frame(a, &send_frame("/queue/chat/42", r#"{"content":"hi"}"#))
            .await;

        assert!(next_frame(&mut rx_b).is_none());
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let (broker, _) = broker();
        let (id, mut rx) = open(&broker).await;

        broker.handle_frame(id, "NONSENSE\n\n\u{0}").await;

        assert_eq!(broker.connection_count().await, 1);
        broker.handle_frame(id, &subscribe_frame("/topic/chat/42")).await;
        assert_eq!(broker.subscribers_of("42").await, vec![id]);
        assert!(next_frame(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_send_is_persisted_with_channel_and_sender() {
        struct ForwardingStore(mpsc::UnboundedSender<ChatRecord>);

        #[async_trait]
        impl ChatStore for ForwardingStore {
            async fn insert_message(&self, record: ChatRecord) -> anyhow::Result<()> {
                self.0.send(record).map_err(|_| anyhow!("receiver gone"))
            }
        }

        let (record_tx, mut record_rx) = mpsc::unbounded_channel();
        let broker = Arc::new(Broker::new(Arc::new(ForwardingStore(record_tx))));
        let (id, _rx) = open(&broker).await;
        broker.handle_frame(id, &subscribe_frame("/topic/chat/42")).await;

        broker
            .handle_frame(id, &send_frame("/app/chat/42", r#"{"content":"hi","userId":7}"#))
            .await;

        let record = record_rx.recv().await.unwrap();
        assert_eq!(record.channel, "42");
        assert_eq!(record.user_id, Some(7));
        assert_eq!(record.content, "hi");
    }

    #[tokio::test]
    async fn test_failing_store_does_not_block_broadcast() {
        struct FailingStore;

        #[async_trait]
        impl ChatStore for FailingStore {
            async fn insert_message(&self, _record: ChatRecord) -> anyhow::Result<()> {
                Err(anyhow!("database unavailable"))
            }
        }

        let broker = Arc::new(Broker::new(Arc::new(FailingStore)));
        let (id, mut rx) = open(&broker).await;
        broker.handle_frame(id, &subscribe_frame("/topic/chat/42")).await;

        broker
            .handle_frame(id, &send_frame("/app/chat/42", r#"{"content":"hi"}"#))
            .await;

        assert!(next_frame(&mut rx).is_some());
    }

    #[tokio::test]
    async fn test_disconnect_frame_asks_transport_to_close() {
        let (broker, _) = broker();
        let (id, mut rx) = open(&broker).await;

        broker
            .handle_frame(id, &Frame::new(Command::Disconnect).encode())
            .await;

        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        // Cleanup is the transport task's job, exactly as for a drop.
        assert_eq!(broker.connection_count().await, 1);
        broker.disconnect(id).await;
        assert_eq!(broker.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_skipped_during_fan_out() {
        let (broker, _) = broker();
        let (a, rx_a) = open(&broker).await;
        let (b, mut rx_b) = open(&broker).await;
        broker.handle_frame(a, &subscribe_frame("/topic/chat/42")).await;
        broker.handle_frame(b, &subscribe_frame("/topic/chat/42")).await;

        // a's transport is gone but its close event has not landed yet.
        drop(rx_a);

        broker
            .handle_frame(b, &send_frame("/app/chat/42", r#"{"content":"hi"}"#))
            .await;

        let frame = next_frame(&mut rx_b).expect("open subscriber still receives");
        assert_eq!(frame.command, Command::Message);
    }
}
