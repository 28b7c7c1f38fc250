use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatMessage, MessageBody, MessageReaction, Sticker, UserProfile};

/// Frames sent over a room WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First frame after a successful connect
    RoomStatus(RoomStatus),

    /// One historical message, oldest first
    History(MessageView),

    /// A freshly accepted message
    Message(MessageView),

    /// A reaction was set or replaced
    Reaction(ReactionView),

    /// A user took their reaction back
    ReactionRemoved { message_id: Uuid, user_id: Uuid },

    /// A user marked a message as read
    Read {
        message_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// The author withdrew a message
    Unsend { message_id: Uuid, user_id: Uuid },

    /// A moderator removed a user; their sockets in the room close right after
    Kicked { room_id: Uuid, user_id: Uuid, banned: bool },

    /// The room was closed; the server disconnects right after this
    RoomDeactivated { room_id: Uuid, reason: String },

    /// A command from this connection was rejected
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Returns true for frames every connection in the room should see.
    pub fn is_room_wide(&self) -> bool {
        !matches!(self, Self::RoomStatus(_) | Self::History(_) | Self::Error { .. })
    }
}

/// Snapshot of a room sent to a newly connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatus {
    pub room_id: Uuid,
    pub name: String,
    pub room_type: String,
    pub capacity: Option<u32>,
    pub member_count: u64,
    pub active_count: usize,
    pub active_users: Vec<Uuid>,
    pub last_active: Option<DateTime<Utc>>,
}

/// Quoted message shown next to a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: Uuid,
    pub user_id: Uuid,
    pub text: Option<String>,
    pub unsent: bool,
}

/// A message with everything a client needs to render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: Uuid,
    pub room_id: Uuid,
    pub author: UserProfile,
    pub body: MessageBody,
    pub mentions: Vec<Uuid>,
    pub unsent: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker: Option<Sticker>,
    #[serde(default)]
    pub reactions: Vec<ReactionView>,
}

impl MessageView {
    /// Bare view with no enrichment beyond the author.
    pub fn from_message(msg: &ChatMessage, author: UserProfile) -> Self {
        Self {
            id: msg.id,
            room_id: msg.room_id,
            author,
            body: msg.body.clone(),
            mentions: msg.mentions.clone(),
            unsent: msg.unsent,
            timestamp: msg.timestamp,
            reply_to: None,
            sticker: None,
            reactions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionView {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub emoji: String,
    pub timestamp: DateTime<Utc>,
}

impl ReactionView {
    pub fn new(reaction: &MessageReaction, username: impl Into<String>) -> Self {
        Self {
            message_id: reaction.message_id,
            user_id: reaction.user_id,
            username: username.into(),
            emoji: reaction.emoji.clone(),
            timestamp: reaction.timestamp,
        }
    }
}

/// Envelope published on a room topic so other instances can fan out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomBroadcast {
    /// Node that produced the event. Consumers on the same node skip it.
    pub origin: String,
    pub room_id: Uuid,
    pub event: ServerEvent,
}

/// Off-band notification for users who are not looking at the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub message_id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub recipients: Vec<Uuid>,
    pub kind: NotificationKind,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    Mention,
}
