use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use chatline_types::models::{
    ChatMessage, DeliveryState, DeliveryStatus, DeliveryStep, MemberAccess, MessageReaction, MessageReadReceipt,
    ReactionRemoval, RestrictionKind, Room, RoomState, Sticker, UserProfile,
};

use crate::{Database, decode_ts};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("{op} task failed: {source}")]
    Join {
        op: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
    #[error("{op} failed: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Async handle on the durable store. Every call runs the blocking SQLite
/// work off the runtime and under one deadline.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    timeout: Duration,
}

impl Store {
    pub fn new(db: Arc<Database>, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `f` on the blocking pool, bounded by the store deadline.
    ///
    /// A timed-out call keeps running to completion in the background; only
    /// the caller stops waiting for it.
    pub async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || f(&db));

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                warn!(op, after = ?self.timeout, "store call timed out");
                Err(StoreError::Timeout {
                    op,
                    after: self.timeout,
                })
            }
            Ok(Err(source)) => Err(StoreError::Join { op, source }),
            Ok(Ok(Err(source))) => Err(StoreError::Database {
                op,
                source: source.into(),
            }),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.call("ping", |db| db.ping()).await
    }

    // -- Rooms & members --

    pub async fn room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        self.call("get_room", move |db| {
            db.get_room(room_id)?.map(|row| row.into_room()).transpose()
        })
        .await
    }

    pub async fn set_room_state(&self, room_id: Uuid, state: RoomState) -> Result<bool, StoreError> {
        self.call("set_room_state", move |db| db.set_room_state(room_id, state))
            .await
    }

    pub async fn member_access(&self, room_id: Uuid, user_id: Uuid) -> Result<MemberAccess, StoreError> {
        self.call("member_access", move |db| {
            let row = db.member_access(room_id, user_id, Utc::now())?;
            Ok(MemberAccess {
                role: row.role()?,
                banned: row.banned,
                muted: row.muted,
            })
        })
        .await
    }

    pub async fn restrict(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        kind: RestrictionKind,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.call("add_restriction", move |db| {
            db.add_restriction(room_id, user_id, kind, expires_at)
        })
        .await
    }

    pub async fn member_count(&self, room_id: Uuid) -> Result<u64, StoreError> {
        self.call("member_count", move |db| db.member_count(room_id)).await
    }

    pub async fn member_ids(&self, room_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        self.call("member_ids", move |db| db.member_ids(room_id)).await
    }

    pub async fn last_active(&self, room_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.call("last_message_at", move |db| {
            db.last_message_at(room_id)?.as_deref().map(decode_ts).transpose()
        })
        .await
    }

    // -- Users & stickers --

    pub async fn profiles(&self, ids: Vec<Uuid>) -> Result<HashMap<Uuid, UserProfile>, StoreError> {
        self.call("get_users", move |db| {
            db.get_users(&ids)?
                .into_iter()
                .map(|row| row.into_profile().map(|p| (p.id, p)))
                .collect()
        })
        .await
    }

    pub async fn users_by_username(&self, usernames: Vec<String>) -> Result<Vec<UserProfile>, StoreError> {
        self.call("get_users_by_username", move |db| {
            db.get_users_by_username(&usernames)?
                .into_iter()
                .map(|row| row.into_profile())
                .collect()
        })
        .await
    }

    pub async fn sticker(&self, id: Uuid) -> Result<Option<Sticker>, StoreError> {
        self.call("get_sticker", move |db| {
            db.get_sticker(id)?.map(|row| row.into_sticker()).transpose()
        })
        .await
    }

    // -- Messages --

    pub async fn save_message(&self, msg: &ChatMessage) -> Result<(), StoreError> {
        let msg = msg.clone();
        self.call("upsert_message", move |db| db.upsert_message(&msg)).await
    }

    pub async fn message(&self, id: Uuid) -> Result<Option<ChatMessage>, StoreError> {
        self.call("get_message", move |db| {
            db.get_message(id)?.map(|row| row.into_message()).transpose()
        })
        .await
    }

    pub async fn recent_messages(&self, room_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        self.call("recent_messages", move |db| {
            db.recent_messages(room_id, limit)?
                .into_iter()
                .map(|row| row.into_message())
                .collect()
        })
        .await
    }

    pub async fn mark_unsent(&self, id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        self.call("mark_unsent", move |db| db.mark_unsent(id, user_id)).await
    }

    pub async fn save_reaction(&self, reaction: &MessageReaction) -> Result<(), StoreError> {
        let reaction = reaction.clone();
        self.call("upsert_reaction", move |db| db.upsert_reaction(&reaction))
            .await
    }

    pub async fn remove_reaction(&self, removal: &ReactionRemoval) -> Result<(), StoreError> {
        let ReactionRemoval {
            message_id,
            user_id,
            room_id,
            timestamp,
        } = *removal;
        self.call("remove_reaction", move |db| {
            db.remove_reaction(message_id, user_id, room_id, timestamp)
        })
        .await
    }

    pub async fn reactions_for(&self, message_ids: Vec<Uuid>) -> Result<Vec<MessageReaction>, StoreError> {
        self.call("reactions_for_messages", move |db| {
            db.reactions_for_messages(&message_ids)?
                .into_iter()
                .map(|row| row.into_reaction())
                .collect()
        })
        .await
    }

    pub async fn save_receipt(&self, receipt: &MessageReadReceipt) -> Result<bool, StoreError> {
        let receipt = receipt.clone();
        self.call("insert_receipt", move |db| db.insert_receipt(&receipt))
            .await
    }

    // -- Delivery status --

    pub async fn create_status(&self, msg: &ChatMessage, broadcast_at: DateTime<Utc>) -> Result<(), StoreError> {
        let msg = msg.clone();
        self.call("insert_status", move |db| db.insert_status(&msg, broadcast_at))
            .await
    }

    pub async fn mark_step(
        &self,
        message_id: Uuid,
        step: DeliveryStep,
    ) -> Result<Option<DeliveryState>, StoreError> {
        self.call("mark_step", move |db| db.mark_step(message_id, step))
            .await
    }

    pub async fn record_failure(
        &self,
        message_id: Uuid,
        step: DeliveryStep,
        error: String,
        attempts: u32,
    ) -> Result<(), StoreError> {
        self.call("record_failure", move |db| {
            db.record_failure(message_id, step, &error, attempts)
        })
        .await
    }

    pub async fn update_status_payload(&self, msg: &ChatMessage) -> Result<(), StoreError> {
        let msg = msg.clone();
        self.call("update_status_payload", move |db| db.update_status_payload(&msg))
            .await
    }

    pub async fn status(&self, message_id: Uuid) -> Result<Option<DeliveryStatus>, StoreError> {
        self.call("get_status", move |db| {
            db.get_status(message_id)?.map(|row| row.into_status()).transpose()
        })
        .await
    }

    /// Message snapshot kept on the status document. Covers messages that
    /// were broadcast but not yet written.
    pub async fn status_payload(&self, message_id: Uuid) -> Result<Option<ChatMessage>, StoreError> {
        self.call("get_status", move |db| {
            db.get_status(message_id)?.map(|row| row.payload()).transpose()
        })
        .await
    }

    /// Incomplete status documents with the message snapshot each one carries.
    pub async fn incomplete_statuses(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(DeliveryStatus, ChatMessage)>, StoreError> {
        self.call("incomplete_statuses", move |db| {
            db.incomplete_statuses(since, limit)?
                .into_iter()
                .map(|row| {
                    let payload = row.payload()?;
                    Ok((row.into_status()?, payload))
                })
                .collect()
        })
        .await
    }

    pub async fn purge_completed_statuses(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.call("purge_completed_statuses", move |db| {
            db.purge_completed_statuses(before)
        })
        .await
    }
}
