//! Connection registry
//!
//! Tracks every live connection: its outbound queue and the set of
//! channels it currently subscribes to.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use crate::frame::Frame;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Item pushed to a connection's transport task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded frame to write to the socket.
    Frame(String),
    /// Ask the transport task to close the socket.
    Close,
}

/// Write half of a connection, drained by the task owning the socket sink.
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// A live connection and its subscription set.
#[derive(Debug)]
pub struct ConnectionEntry {
    id: ConnectionId,
    sender: OutboundSender,
    subscriptions: HashSet<String>,
}

impl ConnectionEntry {
    /// Queue a frame for delivery. Returns `false` when the transport
    /// side is already gone.
    pub fn send(&self, frame: &Frame) -> bool {
        self.sender.send(Outbound::Frame(frame.encode())).is_ok()
    }

    /// Ask the transport task to close the socket.
    pub fn close(&self) {
        let _ = self.sender.send(Outbound::Close);
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn subscriptions(&self) -> &HashSet<String> {
        &self.subscriptions
    }
}

/// Owns all live connection entries. Mutations must stay serialized with
/// the subscription index (see `Broker`).
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    next_id: ConnectionId,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, allocating a fresh identifier with an
    /// empty subscription set.
    pub fn register(&mut self, sender: OutboundSender) -> ConnectionId {
        let id = self.next_id;
        self.next_id += 1;
        self.connections.insert(
            id,
            ConnectionEntry {
                id,
                sender,
                subscriptions: HashSet::new(),
            },
        );
        id
    }

    /// Remove a connection entry. The subscription set must already have
    /// been cleared via `take_subscriptions`.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&id);
        if let Some(entry) = &entry {
            debug_assert!(entry.subscriptions.is_empty());
        }
        entry
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionEntry> {
        self.connections.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Record a subscription on the connection side. Returns `true` if
    /// the channel was not already in the set.
    pub fn add_subscription(&mut self, id: ConnectionId, channel: &str) -> bool {
        self.connections
            .get_mut(&id)
            .map(|entry| entry.subscriptions.insert(channel.to_string()))
            .unwrap_or(false)
    }

    /// Drop a subscription on the connection side. Returns `true` if the
    /// channel was present.
    pub fn remove_subscription(&mut self, id: ConnectionId, channel: &str) -> bool {
        self.connections
            .get_mut(&id)
            .map(|entry| entry.subscriptions.remove(channel))
            .unwrap_or(false)
    }

    pub fn subscriptions_of(&self, id: ConnectionId) -> Option<&HashSet<String>> {
        self.connections.get(&id).map(|entry| &entry.subscriptions)
    }

    /// Drain a connection's subscription set, leaving it empty. Used by
    /// disconnect cleanup; returns an empty set for unknown connections.
    pub fn take_subscriptions(&mut self, id: ConnectionId) -> HashSet<String> {
        self.connections
            .get_mut(&id)
            .map(|entry| std::mem::take(&mut entry.subscriptions))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
