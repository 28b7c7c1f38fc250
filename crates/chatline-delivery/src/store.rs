use async_trait::async_trait;
use uuid::Uuid;

use chatline_db::{Store, StoreError};
use chatline_types::models::{ChatMessage, MessageReaction, MessageReadReceipt, ReactionRemoval};

/// Durable writes and reads the pipeline and history depend on. Every write
/// is an upsert keyed by id, so re-driving one is harmless.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    async fn save_message(&self, msg: &ChatMessage) -> Result<(), StoreError>;
    async fn save_reaction(&self, reaction: &MessageReaction) -> Result<(), StoreError>;
    async fn remove_reaction(&self, removal: &ReactionRemoval) -> Result<(), StoreError>;
    /// Returns false when the receipt already existed.
    async fn save_receipt(&self, receipt: &MessageReadReceipt) -> Result<bool, StoreError>;
    /// Returns false unless `user_id` authored a not yet unsent message.
    async fn mark_unsent(&self, message_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;
    async fn message(&self, message_id: Uuid) -> Result<Option<ChatMessage>, StoreError>;
    /// Newest `limit` visible messages, oldest first.
    async fn recent_messages(&self, room_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;
}

#[async_trait]
impl MessageStore for Store {
    async fn save_message(&self, msg: &ChatMessage) -> Result<(), StoreError> {
        Store::save_message(self, msg).await
    }

    async fn save_reaction(&self, reaction: &MessageReaction) -> Result<(), StoreError> {
        Store::save_reaction(self, reaction).await
    }

    async fn remove_reaction(&self, removal: &ReactionRemoval) -> Result<(), StoreError> {
        Store::remove_reaction(self, removal).await
    }

    async fn save_receipt(&self, receipt: &MessageReadReceipt) -> Result<bool, StoreError> {
        Store::save_receipt(self, receipt).await
    }

    async fn mark_unsent(&self, message_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        Store::mark_unsent(self, message_id, user_id).await
    }

    async fn message(&self, message_id: Uuid) -> Result<Option<ChatMessage>, StoreError> {
        Store::message(self, message_id).await
    }

    async fn recent_messages(&self, room_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        Store::recent_messages(self, room_id, limit).await
    }
}
