/// Database row types. These map directly to SQLite rows and are converted
/// into chatline-types models at the edge of the crate.
use anyhow::{Context, Result};
use uuid::Uuid;

use chatline_types::models::{
    ChatMessage, DeliveryStatus, MemberRole, MessageReaction, Room, Sticker, UserProfile,
};

use crate::decode_ts;

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("bad id in row: {raw}"))
}

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
}

impl UserRow {
    pub fn into_profile(self) -> Result<UserProfile> {
        Ok(UserProfile {
            id: parse_id(&self.id)?,
            username: self.username,
            display_name: self.display_name,
        })
    }
}

pub struct StickerRow {
    pub id: String,
    pub name: String,
    pub image: String,
}

impl StickerRow {
    pub fn into_sticker(self) -> Result<Sticker> {
        Ok(Sticker {
            id: parse_id(&self.id)?,
            name: self.name,
            image: self.image,
        })
    }
}

pub struct RoomRow {
    pub id: String,
    pub name: String,
    pub room_type: String,
    pub state: String,
    pub capacity: Option<i64>,
    pub updated_at: String,
}

impl RoomRow {
    pub fn into_room(self) -> Result<Room> {
        Ok(Room {
            id: parse_id(&self.id)?,
            name: self.name,
            room_type: self.room_type.parse()?,
            state: self.state.parse()?,
            capacity: self.capacity.and_then(|c| u32::try_from(c).ok()),
            updated_at: decode_ts(&self.updated_at)?,
        })
    }
}

pub struct MemberRow {
    pub role: Option<String>,
    pub banned: bool,
    pub muted: bool,
}

impl MemberRow {
    pub fn role(&self) -> Result<Option<MemberRole>> {
        Ok(self
            .role
            .as_deref()
            .map(str::parse::<MemberRole>)
            .transpose()?)
    }
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub body: String,
    pub mentions: String,
    pub unsent: bool,
    pub timestamp: String,
}

impl MessageRow {
    pub fn into_message(self) -> Result<ChatMessage> {
        Ok(ChatMessage {
            id: parse_id(&self.id)?,
            room_id: parse_id(&self.room_id)?,
            user_id: parse_id(&self.user_id)?,
            body: serde_json::from_str(&self.body).context("decoding message body")?,
            mentions: serde_json::from_str(&self.mentions).context("decoding mentions")?,
            unsent: self.unsent,
            timestamp: decode_ts(&self.timestamp)?,
        })
    }
}

pub struct ReactionRow {
    pub message_id: String,
    pub room_id: String,
    pub user_id: String,
    pub emoji: String,
    pub timestamp: String,
}

impl ReactionRow {
    pub fn into_reaction(self) -> Result<MessageReaction> {
        Ok(MessageReaction {
            message_id: parse_id(&self.message_id)?,
            room_id: parse_id(&self.room_id)?,
            user_id: parse_id(&self.user_id)?,
            emoji: self.emoji,
            timestamp: decode_ts(&self.timestamp)?,
        })
    }
}

pub struct StatusRow {
    pub message_id: String,
    pub room_id: String,
    pub broadcast_at: String,
    pub saved_to_store: bool,
    pub saved_to_cache: bool,
    pub notified: bool,
    pub status: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub payload: String,
    pub created_at: String,
    pub updated_at: String,
}

impl StatusRow {
    pub fn into_status(self) -> Result<DeliveryStatus> {
        Ok(DeliveryStatus {
            message_id: parse_id(&self.message_id)?,
            room_id: parse_id(&self.room_id)?,
            broadcast_at: decode_ts(&self.broadcast_at)?,
            saved_to_store: self.saved_to_store,
            saved_to_cache: self.saved_to_cache,
            notified: self.notified,
            status: self.status.parse()?,
            retry_count: u32::try_from(self.retry_count).unwrap_or(u32::MAX),
            last_error: self.last_error,
            created_at: decode_ts(&self.created_at)?,
            updated_at: decode_ts(&self.updated_at)?,
        })
    }

    /// The message snapshot taken at ingest.
    pub fn payload(&self) -> Result<ChatMessage> {
        serde_json::from_str(&self.payload).context("decoding delivery payload")
    }
}
