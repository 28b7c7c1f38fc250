use crate::models::{
    MemberRow, MessageRow, ReactionRow, RoomRow, StatusRow, StickerRow, UserRow,
};
use crate::{Database, encode_ts};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use chatline_types::models::{
    ChatMessage, DeliveryState, DeliveryStep, MemberRole, MessageReaction, MessageReadReceipt,
    RestrictionKind, Room, RoomState, RoomType, Sticker, UserProfile,
};

const MESSAGE_COLUMNS: &str = "id, room_id, user_id, body, mentions, unsent, timestamp";
const STATUS_COLUMNS: &str = "message_id, room_id, broadcast_at, saved_to_store, saved_to_cache, \
     notified, status, retry_count, last_error, payload, created_at, updated_at";

impl Database {
    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
            Ok(())
        })
    }

    // -- Users --

    pub fn upsert_user(&self, user: &UserProfile) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, display_name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username,
                                               display_name = excluded.display_name",
                params![user.id.to_string(), user.username, user.display_name],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, display_name FROM users WHERE id = ?1",
                [id.to_string()],
                user_from_row,
            )
            .optional()
        })
    }

    /// Batch-fetch users by id. Unknown ids are skipped.
    pub fn get_users(&self, ids: &[Uuid]) -> Result<Vec<UserRow>> {
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        self.with_conn(|conn| {
            select_in(
                conn,
                "SELECT id, username, display_name FROM users WHERE id IN",
                &ids,
                user_from_row,
            )
        })
    }

    pub fn get_users_by_username(&self, usernames: &[String]) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            select_in(
                conn,
                "SELECT id, username, display_name FROM users WHERE username IN",
                usernames,
                user_from_row,
            )
        })
    }

    // -- Stickers --

    pub fn insert_sticker(&self, sticker: &Sticker) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO stickers (id, name, image) VALUES (?1, ?2, ?3)",
                params![sticker.id.to_string(), sticker.name, sticker.image],
            )?;
            Ok(())
        })
    }

    pub fn get_sticker(&self, id: Uuid) -> Result<Option<StickerRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, image FROM stickers WHERE id = ?1",
                [id.to_string()],
                |row| {
                    Ok(StickerRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        image: row.get(2)?,
                    })
                },
            )
            .optional()
        })
    }

    // -- Rooms --

    pub fn create_room(&self, room: &Room) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO rooms (id, name, room_type, state, capacity, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    room.id.to_string(),
                    room.name,
                    room.room_type.as_str(),
                    room.state.as_str(),
                    room.capacity,
                    encode_ts(room.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_room(&self, id: Uuid) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, room_type, state, capacity, updated_at FROM rooms WHERE id = ?1",
                [id.to_string()],
                |row| {
                    Ok(RoomRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        room_type: row.get(2)?,
                        state: row.get(3)?,
                        capacity: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Returns false if the room does not exist.
    pub fn set_room_state(&self, id: Uuid, state: RoomState) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE rooms SET state = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), state.as_str(), encode_ts(Utc::now())],
            )?;
            Ok(n > 0)
        })
    }

    pub fn set_room_type(&self, id: Uuid, room_type: RoomType) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE rooms SET room_type = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), room_type.as_str(), encode_ts(Utc::now())],
            )?;
            Ok(n > 0)
        })
    }

    // -- Members & restrictions --

    pub fn add_member(&self, room_id: Uuid, user_id: Uuid, role: MemberRole) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO room_members (room_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(room_id, user_id) DO UPDATE SET role = excluded.role",
                params![
                    room_id.to_string(),
                    user_id.to_string(),
                    role.as_str(),
                    encode_ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn remove_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                params![room_id.to_string(), user_id.to_string()],
            )?;
            Ok(n > 0)
        })
    }

    /// Membership grant plus any restriction still in force at `now`.
    pub fn member_access(&self, room_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Result<MemberRow> {
        let (room, user, now) = (room_id.to_string(), user_id.to_string(), encode_ts(now));
        self.with_conn(|conn| {
            let role: Option<String> = conn
                .query_row(
                    "SELECT role FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                    params![room, user],
                    |r| r.get(0),
                )
                .optional()?;

            let mut stmt = conn.prepare(
                "SELECT kind FROM room_restrictions
                 WHERE room_id = ?1 AND user_id = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
            )?;
            let kinds = stmt
                .query_map(params![room, user, now], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(MemberRow {
                role,
                banned: kinds.iter().any(|k| k == RestrictionKind::Ban.as_str()),
                muted: kinds.iter().any(|k| k == RestrictionKind::Mute.as_str()),
            })
        })
    }

    pub fn member_ids(&self, room_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT user_id FROM room_members WHERE room_id = ?1")?;
            let ids = stmt
                .query_map([room_id.to_string()], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids.iter()
                .map(|s| Uuid::parse_str(s).map_err(Into::into))
                .collect()
        })
    }

    pub fn member_count(&self, room_id: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM room_members WHERE room_id = ?1",
                [room_id.to_string()],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }

    pub fn add_restriction(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        kind: RestrictionKind,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO room_restrictions (room_id, user_id, kind, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    room_id.to_string(),
                    user_id.to_string(),
                    kind.as_str(),
                    expires_at.map(encode_ts),
                ],
            )?;
            Ok(())
        })
    }

    pub fn lift_restriction(&self, room_id: Uuid, user_id: Uuid, kind: RestrictionKind) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM room_restrictions WHERE room_id = ?1 AND user_id = ?2 AND kind = ?3",
                params![room_id.to_string(), user_id.to_string(), kind.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    // -- Messages --

    /// Keyed by message id, so re-driving a write never duplicates it. An
    /// existing row only picks up the unsent flag.
    pub fn upsert_message(&self, msg: &ChatMessage) -> Result<()> {
        let body = serde_json::to_string(&msg.body)?;
        let mentions = serde_json::to_string(&msg.mentions)?;
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages (id, room_id, user_id, body, mentions, unsent, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET unsent = 1
                 WHERE excluded.unsent = 1 AND messages.unsent = 0",
                params![
                    msg.id.to_string(),
                    msg.room_id.to_string(),
                    msg.user_id.to_string(),
                    body,
                    mentions,
                    msg.unsent,
                    encode_ts(msg.timestamp),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id.to_string()],
                message_from_row,
            )
            .optional()
        })
    }

    /// Newest `limit` visible messages of a room, oldest first.
    pub fn recent_messages(&self, room_id: Uuid, limit: usize) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room_id = ?1 AND unsent = 0
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2"
            ))?;
            let mut rows = stmt
                .query_map(params![room_id.to_string(), limit as i64], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    pub fn last_message_at(&self, room_id: Uuid) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let ts: Option<String> = conn.query_row(
                "SELECT MAX(timestamp) FROM messages WHERE room_id = ?1",
                [room_id.to_string()],
                |r| r.get(0),
            )?;
            Ok(ts)
        })
    }

    pub fn message_count(&self, room_id: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE room_id = ?1",
                [room_id.to_string()],
                |r| r.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// Soft-deletes a message. Only the author may do this.
    pub fn mark_unsent(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE messages SET unsent = 1 WHERE id = ?1 AND user_id = ?2",
                params![id.to_string(), user_id.to_string()],
            )?;
            Ok(n > 0)
        })
    }

    // -- Reactions & receipts --

    /// One reaction per (message, user); the latest write wins, removals
    /// included. A late retry carrying an older timestamp changes nothing.
    pub fn upsert_reaction(&self, reaction: &MessageReaction) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO reactions (message_id, user_id, room_id, emoji, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(message_id, user_id) DO UPDATE SET emoji = excluded.emoji,
                                                                timestamp = excluded.timestamp,
                                                                removed = 0
                 WHERE excluded.timestamp >= reactions.timestamp",
                params![
                    reaction.message_id.to_string(),
                    reaction.user_id.to_string(),
                    reaction.room_id.to_string(),
                    reaction.emoji,
                    encode_ts(reaction.timestamp),
                ],
            )?;
            Ok(())
        })
    }

    /// Withdraws the user's reaction as of `at`. Leaves a tombstone so a
    /// reaction written before `at` but applied afterwards stays hidden.
    pub fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, room_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO reactions (message_id, user_id, room_id, emoji, timestamp, removed)
                 VALUES (?1, ?2, ?3, '', ?4, 1)
                 ON CONFLICT(message_id, user_id) DO UPDATE SET timestamp = excluded.timestamp,
                                                                removed = 1
                 WHERE excluded.timestamp >= reactions.timestamp",
                params![
                    message_id.to_string(),
                    user_id.to_string(),
                    room_id.to_string(),
                    encode_ts(at),
                ],
            )?;
            Ok(())
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn reactions_for_messages(&self, message_ids: &[Uuid]) -> Result<Vec<ReactionRow>> {
        let ids: Vec<String> = message_ids.iter().map(Uuid::to_string).collect();
        self.with_conn(|conn| {
            select_in(
                conn,
                "SELECT message_id, room_id, user_id, emoji, timestamp FROM reactions
                 WHERE removed = 0 AND message_id IN",
                &ids,
                |row| {
                    Ok(ReactionRow {
                        message_id: row.get(0)?,
                        room_id: row.get(1)?,
                        user_id: row.get(2)?,
                        emoji: row.get(3)?,
                        timestamp: row.get(4)?,
                    })
                },
            )
        })
    }

    /// Returns false when the receipt already existed.
    pub fn insert_receipt(&self, receipt: &MessageReadReceipt) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO read_receipts (message_id, user_id, room_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    receipt.message_id.to_string(),
                    receipt.user_id.to_string(),
                    receipt.room_id.to_string(),
                    encode_ts(receipt.timestamp),
                ],
            )?;
            Ok(n > 0)
        })
    }

    // -- Delivery status --

    /// Creates the pending status document for a message. A second insert for
    /// the same id is ignored.
    pub fn insert_status(&self, msg: &ChatMessage, broadcast_at: DateTime<Utc>) -> Result<()> {
        let payload = serde_json::to_string(msg)?;
        let now = encode_ts(Utc::now());
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO delivery_status
                   (message_id, room_id, broadcast_at, status, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)",
                params![
                    msg.id.to_string(),
                    msg.room_id.to_string(),
                    encode_ts(broadcast_at),
                    payload,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_status(&self, message_id: Uuid) -> Result<Option<StatusRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {STATUS_COLUMNS} FROM delivery_status WHERE message_id = ?1"),
                [message_id.to_string()],
                status_from_row,
            )
            .optional()
        })
    }

    /// Sets one completion flag. The status flips to completed in the same
    /// statement once all three flags hold, and never leaves completed.
    /// Returns the resulting state, or None if no document exists.
    pub fn mark_step(&self, message_id: Uuid, step: DeliveryStep) -> Result<Option<DeliveryState>> {
        let others: Vec<String> = DeliveryStep::ALL
            .iter()
            .filter(|s| **s != step)
            .map(|s| format!("{} = 1", s.flag()))
            .collect();
        let sql = format!(
            "UPDATE delivery_status
             SET {flag} = 1,
                 status = CASE WHEN status = 'completed' OR ({others}) THEN 'completed' ELSE status END,
                 updated_at = ?2
             WHERE message_id = ?1",
            flag = step.flag(),
            others = others.join(" AND "),
        );
        let id = message_id.to_string();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(&sql, params![id, encode_ts(Utc::now())])?;
            let state: Option<String> = tx
                .query_row(
                    "SELECT status FROM delivery_status WHERE message_id = ?1",
                    [&id],
                    |r| r.get(0),
                )
                .optional()?;
            tx.commit()?;
            state
                .map(|s| s.parse::<DeliveryState>().map_err(anyhow::Error::from))
                .transpose()
        })
    }

    /// Records a step that gave up after retrying. A completed document is
    /// left untouched.
    pub fn record_failure(&self, message_id: Uuid, step: DeliveryStep, error: &str, attempts: u32) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE delivery_status
                 SET status = 'failed', retry_count = retry_count + ?2, last_error = ?3, updated_at = ?4
                 WHERE message_id = ?1 AND status != 'completed'",
                params![
                    message_id.to_string(),
                    attempts,
                    format!("{step}: {error}"),
                    encode_ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    /// Refreshes the snapshot the reconciler re-drives from.
    pub fn update_status_payload(&self, msg: &ChatMessage) -> Result<()> {
        let payload = serde_json::to_string(msg)?;
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE delivery_status SET payload = ?2, updated_at = ?3 WHERE message_id = ?1",
                params![msg.id.to_string(), payload, encode_ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    /// Incomplete documents broadcast at or after `since`, oldest first.
    pub fn incomplete_statuses(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<StatusRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STATUS_COLUMNS} FROM delivery_status
                 WHERE status != 'completed' AND broadcast_at >= ?1
                 ORDER BY broadcast_at ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![encode_ts(since), limit as i64], status_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Drops completed documents broadcast before `before`.
    pub fn purge_completed_statuses(&self, before: DateTime<Utc>) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM delivery_status WHERE status = 'completed' AND broadcast_at < ?1",
                [encode_ts(before)],
            )?;
            Ok(n)
        })
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        user_id: row.get(2)?,
        body: row.get(3)?,
        mentions: row.get(4)?,
        unsent: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<StatusRow> {
    Ok(StatusRow {
        message_id: row.get(0)?,
        room_id: row.get(1)?,
        broadcast_at: row.get(2)?,
        saved_to_store: row.get(3)?,
        saved_to_cache: row.get(4)?,
        notified: row.get(5)?,
        status: row.get(6)?,
        retry_count: row.get(7)?,
        last_error: row.get(8)?,
        payload: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Runs `{prefix} (?1, ?2, ...)` with one placeholder per key.
fn select_in<T, F>(conn: &Connection, prefix: &str, keys: &[String], map: F) -> Result<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    if keys.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<String> = (1..=keys.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!("{} ({})", prefix, placeholders.join(", "));

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> =
        keys.iter().map(|k| k as &dyn rusqlite::types::ToSql).collect();

    let rows = stmt
        .query_map(params.as_slice(), map)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatline_types::models::MessageBody;
    use chrono::SubsecRound;

    fn room(db: &Database, room_type: RoomType) -> Uuid {
        let id = Uuid::new_v4();
        db.create_room(&Room {
            id,
            name: "general".into(),
            room_type,
            state: RoomState::Active,
            capacity: None,
            updated_at: Utc::now(),
        })
        .unwrap();
        id
    }

    fn message(room_id: Uuid, text: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            user_id: Uuid::new_v4(),
            body: MessageBody::Text { text: text.into() },
            mentions: vec![],
            unsent: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn upsert_message_is_keyed_by_id() {
        let db = Database::open_in_memory().unwrap();
        let room_id = room(&db, RoomType::Open);
        let msg = message(room_id, "hello");

        db.upsert_message(&msg).unwrap();
        db.upsert_message(&msg).unwrap();
        assert_eq!(db.message_count(room_id).unwrap(), 1);

        let stored = db.get_message(msg.id).unwrap().unwrap().into_message().unwrap();
        assert_eq!(stored.body, msg.body);
        assert_eq!(stored.timestamp, msg.timestamp.trunc_subsecs(6));
    }

    #[test]
    fn recent_messages_are_chronological_and_skip_unsent() {
        let db = Database::open_in_memory().unwrap();
        let room_id = room(&db, RoomType::Open);
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut msg = message(room_id, &format!("m{i}"));
            msg.timestamp = base + chrono::Duration::milliseconds(i);
            db.upsert_message(&msg).unwrap();
            ids.push((msg.id, msg.user_id));
        }
        assert!(db.mark_unsent(ids[4].0, ids[4].1).unwrap());
        assert!(!db.mark_unsent(ids[3].0, Uuid::new_v4()).unwrap());

        let rows = db.recent_messages(room_id, 2).unwrap();
        let got: Vec<String> = rows.into_iter().map(|r| r.id).collect();
        assert_eq!(got, vec![ids[2].0.to_string(), ids[3].0.to_string()]);
    }

    #[test]
    fn status_completes_only_when_all_flags_hold() {
        let db = Database::open_in_memory().unwrap();
        let msg = message(Uuid::new_v4(), "x");
        db.insert_status(&msg, Utc::now()).unwrap();

        assert_eq!(db.mark_step(msg.id, DeliveryStep::Store).unwrap(), Some(DeliveryState::Pending));
        db.record_failure(msg.id, DeliveryStep::Notify, "broker down", 3).unwrap();
        assert_eq!(db.mark_step(msg.id, DeliveryStep::Cache).unwrap(), Some(DeliveryState::Failed));
        assert_eq!(db.mark_step(msg.id, DeliveryStep::Notify).unwrap(), Some(DeliveryState::Completed));

        // completed never regresses
        db.record_failure(msg.id, DeliveryStep::Store, "late", 1).unwrap();
        let row = db.get_status(msg.id).unwrap().unwrap().into_status().unwrap();
        assert_eq!(row.status, DeliveryState::Completed);
        assert_eq!(row.retry_count, 3);

        assert_eq!(db.mark_step(Uuid::new_v4(), DeliveryStep::Store).unwrap(), None);
    }

    #[test]
    fn incomplete_statuses_respect_window_and_purge() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let old = message(Uuid::new_v4(), "old");
        let fresh = message(Uuid::new_v4(), "fresh");
        db.insert_status(&old, now - chrono::Duration::hours(2)).unwrap();
        db.insert_status(&fresh, now).unwrap();

        let rows = db.incomplete_statuses(now - chrono::Duration::hours(1), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload().unwrap(), fresh);

        for step in DeliveryStep::ALL {
            db.mark_step(old.id, step).unwrap();
        }
        assert_eq!(db.purge_completed_statuses(now - chrono::Duration::hours(1)).unwrap(), 1);
        assert!(db.get_status(old.id).unwrap().is_none());
    }

    #[test]
    fn member_access_honours_expiry() {
        let db = Database::open_in_memory().unwrap();
        let room_id = room(&db, RoomType::Restricted);
        let user = Uuid::new_v4();
        let now = Utc::now();

        db.add_member(room_id, user, MemberRole::Moderator).unwrap();
        db.add_restriction(room_id, user, RestrictionKind::Mute, Some(now - chrono::Duration::minutes(1)))
            .unwrap();
        db.add_restriction(room_id, user, RestrictionKind::Ban, None).unwrap();

        let access = db.member_access(room_id, user, now).unwrap();
        assert_eq!(access.role().unwrap(), Some(MemberRole::Moderator));
        assert!(access.banned);
        assert!(!access.muted);
        assert_eq!(db.member_ids(room_id).unwrap(), vec![user]);
    }

    #[test]
    fn reaction_latest_wins_and_receipt_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let (message_id, room_id, user_id) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for emoji in ["👍", "🎉"] {
            db.upsert_reaction(&MessageReaction {
                message_id,
                room_id,
                user_id,
                emoji: emoji.into(),
                timestamp: Utc::now(),
            })
            .unwrap();
        }
        let rows = db.reactions_for_messages(&[message_id]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].emoji, "🎉");

        let receipt = MessageReadReceipt {
            message_id,
            room_id,
            user_id,
            timestamp: Utc::now(),
        };
        assert!(db.insert_receipt(&receipt).unwrap());
        assert!(!db.insert_receipt(&receipt).unwrap());
    }

    #[test]
    fn older_reaction_never_replaces_a_newer_one() {
        let db = Database::open_in_memory().unwrap();
        let (message_id, room_id, user_id) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let t = Utc::now();
        let react = |emoji: &str, timestamp| MessageReaction {
            message_id,
            room_id,
            user_id,
            emoji: emoji.into(),
            timestamp,
        };

        db.upsert_reaction(&react("🎉", t + chrono::Duration::seconds(1))).unwrap();
        // a retried write from before
        db.upsert_reaction(&react("👍", t)).unwrap();

        let rows = db.reactions_for_messages(&[message_id]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].emoji, "🎉");
    }

    #[test]
    fn removal_is_ordered_against_reaction_writes() {
        let db = Database::open_in_memory().unwrap();
        let (message_id, room_id, user_id) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let t = Utc::now();
        let react = |emoji: &str, timestamp| MessageReaction {
            message_id,
            room_id,
            user_id,
            emoji: emoji.into(),
            timestamp,
        };

        // the removal lands before the reaction it withdraws
        db.remove_reaction(message_id, user_id, room_id, t + chrono::Duration::seconds(1))
            .unwrap();
        db.upsert_reaction(&react("👍", t)).unwrap();
        assert!(db.reactions_for_messages(&[message_id]).unwrap().is_empty());

        // a removal older than the current reaction is ignored
        db.upsert_reaction(&react("🔥", t + chrono::Duration::seconds(3))).unwrap();
        db.remove_reaction(message_id, user_id, room_id, t + chrono::Duration::seconds(2))
            .unwrap();
        let rows = db.reactions_for_messages(&[message_id]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].emoji, "🔥");

        db.remove_reaction(message_id, user_id, room_id, t + chrono::Duration::seconds(4))
            .unwrap();
        assert!(db.reactions_for_messages(&[message_id]).unwrap().is_empty());
    }
}
