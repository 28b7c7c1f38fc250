//! Sliding window of recent messages per room.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use chatline_types::models::ChatMessage;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Messages kept per room.
    pub window: usize,
    /// Idle time after which a room's cache expires.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            window: 1000,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

type Score = (DateTime<Utc>, Uuid);

struct RoomWindow {
    ordered: BTreeMap<Score, ChatMessage>,
    by_id: HashMap<Uuid, Score>,
    expires_at: Instant,
}

impl RoomWindow {
    fn new(ttl: Duration) -> Self {
        Self {
            ordered: BTreeMap::new(),
            by_id: HashMap::new(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn expire_if_stale(&mut self, now: Instant) {
        if now >= self.expires_at {
            self.ordered.clear();
            self.by_id.clear();
        }
    }

    fn touch(&mut self, now: Instant, ttl: Duration) {
        self.expires_at = now + ttl;
    }
}

/// Per-room ordered windows scored by message timestamp. Each room has its
/// own lock; the outer map lock is only taken exclusively to add or drop
/// rooms.
pub struct RoomCache {
    rooms: RwLock<HashMap<Uuid, Mutex<RoomWindow>>>,
    config: CacheConfig,
}

impl RoomCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config: CacheConfig {
                window: config.window.max(1),
                ..config
            },
        }
    }

    pub fn window(&self) -> usize {
        self.config.window
    }

    fn with_room<R>(&self, room_id: Uuid, f: impl FnOnce(&mut RoomWindow) -> R) -> Option<R> {
        let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
        let window = rooms.get(&room_id)?;
        let mut window = window.lock().unwrap_or_else(|p| p.into_inner());
        window.expire_if_stale(Instant::now());
        Some(f(&mut window))
    }

    fn with_room_or_insert<R>(&self, room_id: Uuid, f: impl FnOnce(&mut RoomWindow) -> R) -> R {
        // fast path: room already present, shared map lock
        {
            let rooms = self.rooms.read().unwrap_or_else(|p| p.into_inner());
            if let Some(window) = rooms.get(&room_id) {
                let mut window = window.lock().unwrap_or_else(|p| p.into_inner());
                window.expire_if_stale(Instant::now());
                return f(&mut window);
            }
        }
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        let window = rooms
            .entry(room_id)
            .or_insert_with(|| Mutex::new(RoomWindow::new(self.config.ttl)));
        let window = window.get_mut().unwrap_or_else(|p| p.into_inner());
        window.expire_if_stale(Instant::now());
        f(window)
    }

    /// Inserts (or replaces by id) a message, trims the room to the window
    /// and refreshes its expiry.
    pub fn append(&self, msg: &ChatMessage) {
        let (window, ttl) = (self.config.window, self.config.ttl);
        self.with_room_or_insert(msg.room_id, |room| {
            let score = (msg.timestamp, msg.id);
            let mut entry = msg.clone();
            if let Some(old) = room.by_id.insert(msg.id, score) {
                // a withdrawn message stays withdrawn
                let was_unsent = room.ordered.remove(&old).is_some_and(|m| m.unsent);
                entry.unsent |= was_unsent;
            }
            room.ordered.insert(score, entry);
            while room.ordered.len() > window {
                if let Some(((_, evicted), _)) = room.ordered.pop_first() {
                    room.by_id.remove(&evicted);
                }
            }
            room.touch(Instant::now(), ttl);
        });
    }

    /// Seeds a room from the durable store after a short read.
    pub fn warm(&self, room_id: Uuid, messages: &[ChatMessage]) {
        for msg in messages.iter().filter(|m| m.room_id == room_id) {
            self.append(msg);
        }
        debug!(room_id = %room_id, count = messages.len(), "cache: warmed");
    }

    /// Newest `limit` entries, oldest first. Reading refreshes the expiry.
    pub fn recent(&self, room_id: Uuid, limit: usize) -> Vec<ChatMessage> {
        let ttl = self.config.ttl;
        self.with_room(room_id, |room| {
            if room.ordered.is_empty() {
                return Vec::new();
            }
            room.touch(Instant::now(), ttl);
            let mut out: Vec<ChatMessage> = room.ordered.values().rev().take(limit).cloned().collect();
            out.reverse();
            out
        })
        .unwrap_or_default()
    }

    pub fn get(&self, room_id: Uuid, message_id: Uuid) -> Option<ChatMessage> {
        self.with_room(room_id, |room| {
            let score = room.by_id.get(&message_id)?;
            room.ordered.get(score).cloned()
        })
        .flatten()
    }

    pub fn mark_unsent(&self, room_id: Uuid, message_id: Uuid) -> bool {
        self.with_room(room_id, |room| {
            let Some(score) = room.by_id.get(&message_id).copied() else {
                return false;
            };
            room.ordered
                .get_mut(&score)
                .map(|msg| msg.unsent = true)
                .is_some()
        })
        .unwrap_or(false)
    }

    pub fn latest_timestamp(&self, room_id: Uuid) -> Option<DateTime<Utc>> {
        self.with_room(room_id, |room| {
            room.ordered.last_key_value().map(|((ts, _), _)| *ts)
        })
        .flatten()
    }

    pub fn len(&self, room_id: Uuid) -> usize {
        self.with_room(room_id, |room| room.ordered.len()).unwrap_or(0)
    }

    /// Empties a room's cache. The durable store is not touched.
    pub fn clear(&self, room_id: Uuid) -> bool {
        let removed = self
            .rooms
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&room_id);
        removed.is_some_and(|w| !w.into_inner().unwrap_or_else(|p| p.into_inner()).ordered.is_empty())
    }

    /// Drops rooms whose expiry has passed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut rooms = self.rooms.write().unwrap_or_else(|p| p.into_inner());
        let before = rooms.len();
        rooms.retain(|_, w| w.get_mut().map(|w| w.expires_at > now).unwrap_or(false));
        before - rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatline_types::models::MessageBody;

    fn msg(room_id: Uuid, n: i64, base: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            user_id: Uuid::new_v4(),
            body: MessageBody::Text {
                text: format!("m{n}"),
            },
            mentions: vec![],
            unsent: false,
            timestamp: base + chrono::Duration::milliseconds(n),
        }
    }

    fn texts(messages: &[ChatMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| m.body.text().map(str::to_string))
            .collect()
    }

    #[test]
    fn window_keeps_the_newest_n_in_order() {
        let cache = RoomCache::new(CacheConfig {
            window: 3,
            ..CacheConfig::default()
        });
        let room = Uuid::new_v4();
        let base = Utc::now();
        // inserted out of order on purpose
        for n in [2, 0, 4, 1, 3] {
            cache.append(&msg(room, n, base));
        }

        assert_eq!(cache.len(room), 3);
        assert_eq!(texts(&cache.recent(room, 3)), vec!["m2", "m3", "m4"]);
        assert_eq!(texts(&cache.recent(room, 2)), vec!["m3", "m4"]);
        assert_eq!(texts(&cache.recent(room, 10)), vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn append_is_keyed_by_id() {
        let cache = RoomCache::new(CacheConfig::default());
        let room = Uuid::new_v4();
        let m = msg(room, 0, Utc::now());
        cache.append(&m);
        cache.append(&m);
        assert_eq!(cache.len(room), 1);
        assert!(cache.mark_unsent(room, m.id));
        assert!(cache.get(room, m.id).unwrap().unsent);

        cache.append(&m);
        assert!(cache.get(room, m.id).unwrap().unsent);
    }

    #[test]
    fn clear_leaves_other_rooms() {
        let cache = RoomCache::new(CacheConfig::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        cache.append(&msg(a, 0, Utc::now()));
        cache.append(&msg(b, 0, Utc::now()));

        assert!(cache.clear(a));
        assert!(cache.recent(a, 10).is_empty());
        assert_eq!(cache.len(b), 1);
        assert!(!cache.clear(a));
    }

    #[test]
    fn expired_room_reads_empty() {
        let cache = RoomCache::new(CacheConfig {
            window: 10,
            ttl: Duration::from_millis(20),
        });
        let room = Uuid::new_v4();
        cache.append(&msg(room, 0, Utc::now()));
        std::thread::sleep(Duration::from_millis(40));

        assert!(cache.recent(room, 10).is_empty());
        assert_eq!(cache.purge_expired(), 1);
    }
}
