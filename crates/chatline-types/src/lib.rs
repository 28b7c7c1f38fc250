pub mod api;
pub mod commands;
pub mod events;
pub mod models;

/// Broker topic prefix for per-room fan-out.
pub const ROOM_TOPIC_PREFIX: &str = "chat-room-";

/// Broker topic for off-band notification events.
pub const NOTIFICATIONS_TOPIC: &str = "chat-notifications";

pub fn room_topic(room_id: uuid::Uuid) -> String {
    format!("{}{}", ROOM_TOPIC_PREFIX, room_id)
}
