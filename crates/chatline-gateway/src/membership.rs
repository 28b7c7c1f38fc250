//! Who is in a room on this instance, and what they may send there.

use std::collections::HashMap;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use chatline_db::{Store, StoreError};
use chatline_types::events::RoomStatus;
use chatline_types::models::{MemberAccess, Room, RoomType};

const SHARDS: usize = 16;

/// Room and member lookups the gate needs from the durable store.
#[async_trait]
pub trait RoomDirectory: Send + Sync + 'static {
    async fn room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError>;
    async fn access(&self, room_id: Uuid, user_id: Uuid) -> Result<MemberAccess, StoreError>;
    async fn member_count(&self, room_id: Uuid) -> Result<u64, StoreError>;
    async fn last_active(&self, room_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[async_trait]
impl RoomDirectory for Store {
    async fn room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        Store::room(self, room_id).await
    }

    async fn access(&self, room_id: Uuid, user_id: Uuid) -> Result<MemberAccess, StoreError> {
        self.member_access(room_id, user_id).await
    }

    async fn member_count(&self, room_id: Uuid) -> Result<u64, StoreError> {
        Store::member_count(self, room_id).await
    }

    async fn last_active(&self, room_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError> {
        Store::last_active(self, room_id).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("room {0} not found")]
    RoomNotFound(Uuid),
    #[error("room {0} is closed")]
    RoomClosed(Uuid),
    #[error("room {room_id} is full ({capacity} connections)")]
    CapacityExceeded { room_id: Uuid, capacity: u32 },
    #[error("not a member of room {0}")]
    NotMember(Uuid),
    #[error("banned from room {0}")]
    Banned(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GateError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "room_not_found",
            Self::RoomClosed(_) => "room_closed",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::NotMember(_) => "not_member",
            Self::Banned(_) => "banned",
            Self::Store(_) => "unavailable",
        }
    }
}

/// Why a send was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Denial {
    #[error("room not found")]
    RoomNotFound,
    #[error("room is closed")]
    RoomClosed,
    #[error("not connected to this room")]
    NotInRoom,
    #[error("room is restricted to its members")]
    NotMember,
    #[error("only moderators can post in this room")]
    ReadOnly,
    #[error("banned from this room")]
    Banned,
    #[error("muted in this room")]
    Muted,
    #[error("room data is unavailable, try again")]
    Unavailable,
}

impl Denial {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound => "room_not_found",
            Self::RoomClosed => "room_closed",
            Self::NotInRoom => "not_in_room",
            Self::NotMember => "not_member",
            Self::ReadOnly => "read_only",
            Self::Banned => "banned",
            Self::Muted => "muted",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    Message,
    Sticker,
    Reaction,
}

/// Decides a send from a fresh view of the room and the sender.
pub fn permits(room: &Room, access: &MemberAccess, in_room: bool) -> Result<(), Denial> {
    if room.is_closed() {
        return Err(Denial::RoomClosed);
    }
    if !in_room {
        return Err(Denial::NotInRoom);
    }
    if access.banned {
        return Err(Denial::Banned);
    }
    if access.muted {
        return Err(Denial::Muted);
    }
    match room.room_type {
        RoomType::Open => Ok(()),
        RoomType::Restricted if !access.is_granted() => Err(Denial::NotMember),
        RoomType::Restricted => Ok(()),
        // reads stay open, every kind of send needs a privileged role
        RoomType::Announcement if access.is_privileged() => Ok(()),
        RoomType::Announcement => Err(Denial::ReadOnly),
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Refuse connects beyond a room's capacity.
    pub enforce_capacity: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enforce_capacity: true,
        }
    }
}

/// Per-room occupancy: user -> open connection count. Rooms at zero are
/// removed from their shard.
type Occupancy = HashMap<Uuid, usize>;

#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

struct GateInner {
    directory: Arc<dyn RoomDirectory>,
    shards: Vec<Mutex<HashMap<Uuid, Occupancy>>>,
    config: GateConfig,
}

impl Gate {
    pub fn new(directory: Arc<dyn RoomDirectory>, config: GateConfig) -> Self {
        Self {
            inner: Arc::new(GateInner {
                directory,
                shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
                config,
            }),
        }
    }

    fn shard(&self, room_id: Uuid) -> MutexGuard<'_, HashMap<Uuid, Occupancy>> {
        let mut hasher = DefaultHasher::new();
        room_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.inner.shards.len();
        // counters stay consistent even if a holder panicked mid-update
        self.inner.shards[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Checks that the room accepts this user and counts the connection.
    pub async fn validate_and_track(&self, room_id: Uuid, user_id: Uuid) -> Result<Room, GateError> {
        let room = self
            .inner
            .directory
            .room(room_id)
            .await?
            .ok_or(GateError::RoomNotFound(room_id))?;
        if room.is_closed() {
            return Err(GateError::RoomClosed(room_id));
        }

        let access = self.inner.directory.access(room_id, user_id).await?;
        if access.banned {
            return Err(GateError::Banned(room_id));
        }
        if room.room_type == RoomType::Restricted && !access.is_granted() {
            return Err(GateError::NotMember(room_id));
        }

        let mut shard = self.shard(room_id);
        if let (true, Some(capacity)) = (self.inner.config.enforce_capacity, room.capacity) {
            let open: usize = shard.get(&room_id).map_or(0, |o| o.values().sum());
            if open >= capacity as usize {
                return Err(GateError::CapacityExceeded { room_id, capacity });
            }
        }
        let occupancy = shard.entry(room_id).or_default();
        *occupancy.entry(user_id).or_default() += 1;
        debug!(room_id = %room_id, user_id = %user_id, "gate: connection tracked");
        Ok(room)
    }

    /// Forgets one connection of `user_id`. Extra calls are ignored.
    pub fn remove_connection(&self, room_id: Uuid, user_id: Uuid) {
        let mut shard = self.shard(room_id);
        let Some(occupancy) = shard.get_mut(&room_id) else {
            warn!(room_id = %room_id, user_id = %user_id, "gate: remove for untracked room");
            return;
        };
        if let Entry::Occupied(mut slot) = occupancy.entry(user_id) {
            *slot.get_mut() -= 1;
            if *slot.get() == 0 {
                slot.remove();
            }
        }
        if occupancy.is_empty() {
            shard.remove(&room_id);
        }
    }

    pub fn is_user_in_room(&self, room_id: Uuid, user_id: Uuid) -> bool {
        self.shard(room_id)
            .get(&room_id)
            .is_some_and(|o| o.contains_key(&user_id))
    }

    pub fn active_connections(&self, room_id: Uuid) -> usize {
        self.shard(room_id)
            .get(&room_id)
            .map_or(0, |o| o.values().sum())
    }

    pub fn active_users(&self, room_id: Uuid) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self
            .shard(room_id)
            .get(&room_id)
            .map(|o| o.keys().copied().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Runs `f` only if the room has no tracked connections, while holding
    /// the lock that `validate_and_track` needs. A connect cannot slip in
    /// between the check and `f`.
    pub fn when_vacant<R>(&self, room_id: Uuid, f: impl FnOnce() -> R) -> Option<R> {
        let shard = self.shard(room_id);
        let occupied = shard.get(&room_id).is_some_and(|o| !o.is_empty());
        if occupied {
            return None;
        }
        let out = f();
        drop(shard);
        Some(out)
    }

    pub async fn check_send(&self, room_id: Uuid, user_id: Uuid, kind: SendKind) -> Result<(), Denial> {
        let room = match self.inner.directory.room(room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => return Err(Denial::RoomNotFound),
            Err(e) => {
                warn!(room_id = %room_id, "gate: room lookup failed: {}", e);
                return Err(Denial::Unavailable);
            }
        };
        // fail closed when restrictions cannot be read
        let access = match self.inner.directory.access(room_id, user_id).await {
            Ok(access) => access,
            Err(e) => {
                warn!(room_id = %room_id, user_id = %user_id, "gate: access lookup failed: {}", e);
                return Err(Denial::Unavailable);
            }
        };
        permits(&room, &access, self.is_user_in_room(room_id, user_id)).inspect_err(|denial| {
            debug!(room_id = %room_id, user_id = %user_id, ?kind, %denial, "gate: send refused");
        })
    }

    pub async fn can_send_message(&self, room_id: Uuid, user_id: Uuid) -> bool {
        self.check_send(room_id, user_id, SendKind::Message).await.is_ok()
    }

    pub async fn can_send_sticker(&self, room_id: Uuid, user_id: Uuid) -> bool {
        self.check_send(room_id, user_id, SendKind::Sticker).await.is_ok()
    }

    pub async fn can_send_reaction(&self, room_id: Uuid, user_id: Uuid) -> bool {
        self.check_send(room_id, user_id, SendKind::Reaction).await.is_ok()
    }

    pub async fn room_status(&self, room_id: Uuid) -> Result<RoomStatus, GateError> {
        let room = self
            .inner
            .directory
            .room(room_id)
            .await?
            .ok_or(GateError::RoomNotFound(room_id))?;
        let member_count = self.inner.directory.member_count(room_id).await?;
        let last_active = self.inner.directory.last_active(room_id).await?;
        let active_users = self.active_users(room_id);

        Ok(RoomStatus {
            room_id,
            name: room.name,
            room_type: room.room_type.as_str().to_string(),
            capacity: room.capacity,
            member_count,
            active_count: self.active_connections(room_id),
            active_users,
            last_active,
        })
    }
}
