use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- Rooms --

/// How a room treats posting rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    /// Anyone who can connect can post.
    Open,
    /// Everyone can read, only privileged members can post or react.
    Announcement,
    /// Only members with an explicit grant can connect or post.
    Restricted,
}

impl RoomType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Announcement => "announcement",
            Self::Restricted => "restricted",
        }
    }
}

impl FromStr for RoomType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "announcement" => Ok(Self::Announcement),
            "restricted" => Ok(Self::Restricted),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Active,
    Closed,
}

impl RoomState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for RoomState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" | "inactive" => Ok(Self::Closed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub room_type: RoomType,
    pub state: RoomState,
    /// Maximum concurrent connections on this instance, if limited.
    pub capacity: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn is_closed(&self) -> bool {
        self.state == RoomState::Closed
    }
}

/// A member's standing inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Member,
    Moderator,
    Owner,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Moderator => "moderator",
            Self::Owner => "owner",
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Moderator | Self::Owner)
    }
}

impl FromStr for MemberRole {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Self::Member),
            "moderator" => Ok(Self::Moderator),
            "owner" => Ok(Self::Owner),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictionKind {
    Ban,
    Mute,
}

impl RestrictionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Mute => "mute",
        }
    }
}

impl FromStr for RestrictionKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ban" => Ok(Self::Ban),
            "mute" => Ok(Self::Mute),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// What the store knows about one user in one room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberAccess {
    /// Explicit membership grant, if any.
    pub role: Option<MemberRole>,
    pub banned: bool,
    pub muted: bool,
}

impl MemberAccess {
    pub fn is_granted(&self) -> bool {
        self.role.is_some()
    }

    pub fn is_privileged(&self) -> bool {
        self.role.is_some_and(|r| r.is_privileged())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

// -- Users & stickers --

/// Author identity attached to outgoing frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
}

impl UserProfile {
    /// Placeholder used when the profile lookup fails.
    pub fn unknown(id: Uuid) -> Self {
        Self {
            id,
            username: String::new(),
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sticker {
    pub id: Uuid,
    pub name: String,
    pub image: String,
}

// -- Messages --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub url: String,
    pub name: String,
    pub content_type: Option<String>,
}

/// The payload of a chat message. Exactly one shape per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text { text: String },
    Reply { reply_to: Uuid, text: String },
    Sticker { sticker_id: Uuid },
    File { file: FileRef, caption: Option<String> },
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reply { .. } => "reply",
            Self::Sticker { .. } => "sticker",
            Self::File { .. } => "file",
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::Reply { text, .. } => Some(text),
            Self::File { caption, .. } => caption.as_deref(),
            Self::Sticker { .. } => None,
        }
    }

    pub fn reply_to(&self) -> Option<Uuid> {
        match self {
            Self::Reply { reply_to, .. } => Some(*reply_to),
            _ => None,
        }
    }

    pub fn sticker_id(&self) -> Option<Uuid> {
        match self {
            Self::Sticker { sticker_id } => Some(*sticker_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub body: MessageBody,
    /// Users referenced with `@username` in the text.
    #[serde(default)]
    pub mentions: Vec<Uuid>,
    #[serde(default)]
    pub unsent: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReaction {
    pub message_id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
    pub timestamp: DateTime<Utc>,
}

/// A user taking their reaction on a message back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRemoval {
    pub message_id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReadReceipt {
    pub message_id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

// -- Delivery tracking --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Completed,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// One of the three side effects every accepted message goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStep {
    Store,
    Cache,
    Notify,
}

impl DeliveryStep {
    pub const ALL: [DeliveryStep; 3] = [Self::Store, Self::Cache, Self::Notify];

    /// Column of the delivery-status document this step flips.
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Store => "saved_to_store",
            Self::Cache => "saved_to_cache",
            Self::Notify => "notified",
        }
    }
}

impl fmt::Display for DeliveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Store => "store",
            Self::Cache => "cache",
            Self::Notify => "notify",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub message_id: Uuid,
    pub room_id: Uuid,
    pub broadcast_at: DateTime<Utc>,
    pub saved_to_store: bool,
    pub saved_to_cache: bool,
    pub notified: bool,
    pub status: DeliveryState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryStatus {
    pub fn is_done(&self, step: DeliveryStep) -> bool {
        match step {
            DeliveryStep::Store => self.saved_to_store,
            DeliveryStep::Cache => self.saved_to_cache,
            DeliveryStep::Notify => self.notified,
        }
    }

    /// Steps whose flag is still false.
    pub fn missing(&self) -> Vec<DeliveryStep> {
        DeliveryStep::ALL
            .into_iter()
            .filter(|s| !self.is_done(*s))
            .collect()
    }
}
