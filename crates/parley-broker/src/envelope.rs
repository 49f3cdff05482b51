//! Chat message envelope carried in SEND and MESSAGE bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload of a client SEND frame. Only `content` is required.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundChat {
    pub content: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
}

/// Payload of a broker MESSAGE frame, with server-assigned id and
/// timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundChat {
    pub id: String,
    pub room_id: String,
    pub content: String,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub avatar: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OutboundChat {
    /// Build the broadcast payload for a message published to `channel`.
    pub fn from_inbound(inbound: InboundChat, channel: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id: channel.to_string(),
            content: inbound.content,
            user_id: inbound.user_id,
            username: inbound.username,
            avatar: inbound.avatar,
            timestamp: Utc::now(),
        }
    }
}

/// Row handed to the persistence sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub channel: String,
    pub user_id: Option<i64>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
