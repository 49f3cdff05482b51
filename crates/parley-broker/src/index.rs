//! Subscription index: channel id → subscriber set.
//!
//! A channel exists only while it has subscribers; the last unsubscribe
//! removes it entirely.

use std::collections::{HashMap, HashSet};

use crate::registry::ConnectionId;

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    channels: HashMap<String, HashSet<ConnectionId>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber to a channel, creating the channel on first use.
    /// Idempotent; returns `true` if the subscriber was newly added.
    pub fn subscribe(&mut self, channel: &str, id: ConnectionId) -> bool {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id)
    }

    /// Remove a subscriber from a channel, pruning the channel if it is
    /// left empty. Returns `true` if the subscriber was present.
    pub fn unsubscribe(&mut self, channel: &str, id: ConnectionId) -> bool {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = subscribers.remove(&id);
        if subscribers.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Current subscribers of a channel; empty for unknown channels.
    pub fn subscribers_of(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .get(channel)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove a connection from every channel in `channels`, pruning
    /// channels left empty. Used on disconnect.
    pub fn remove_connection_everywhere<'a>(
        &mut self,
        id: ConnectionId,
        channels: impl IntoIterator<Item = &'a String>,
    ) {
        for channel in channels {
            self.unsubscribe(channel, id);
        }
    }

    pub fn contains_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
