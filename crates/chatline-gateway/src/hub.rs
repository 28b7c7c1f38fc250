use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use chatline_types::events::ServerEvent;

/// Identity of one accepted socket. The outbound queue itself lives in the
/// hub, so dropping the hub's entry is what ends the connection's writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub conn_id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
}

struct Entry {
    user_id: Uuid,
    tx: mpsc::Sender<Utf8Bytes>,
}

/// conn_id -> entry for one room
type RoomConns = Mutex<HashMap<Uuid, Entry>>;

fn lock(conns: &RoomConns) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
    conns.lock().unwrap_or_else(|p| p.into_inner())
}

/// Registry of live sockets grouped by room. The only component that hands
/// bytes to a client writer.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

/// The outer map only changes when a room gains its first or loses its last
/// local connection. Everything else takes the read side plus that room's
/// own mutex, so busy rooms do not serialize each other.
struct HubInner {
    rooms: RwLock<HashMap<Uuid, RoomConns>>,
    queue_size: usize,
}

impl Hub {
    pub fn new(queue_size: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: RwLock::new(HashMap::new()),
                queue_size: queue_size.max(1),
            }),
        }
    }

    /// Registers a new connection and returns the receiving end of its
    /// bounded outbound queue.
    pub async fn register(&self, room_id: Uuid, user_id: Uuid) -> (Connection, mpsc::Receiver<Utf8Bytes>) {
        let conn = Connection {
            conn_id: Uuid::new_v4(),
            room_id,
            user_id,
        };
        let (tx, rx) = mpsc::channel(self.inner.queue_size);
        let entry = Entry { user_id, tx };

        let entry = {
            let rooms = self.inner.rooms.read().await;
            match rooms.get(&room_id) {
                Some(conns) => {
                    lock(conns).insert(conn.conn_id, entry);
                    None
                }
                None => Some(entry),
            }
        };
        if let Some(entry) = entry {
            let mut rooms = self.inner.rooms.write().await;
            let conns = rooms.entry(room_id).or_default();
            lock(conns).insert(conn.conn_id, entry);
        }
        debug!(room_id = %room_id, user_id = %user_id, conn_id = %conn.conn_id, "hub: registered");
        (conn, rx)
    }

    /// Runs `f` against one room's connections. `None` if the room has none.
    async fn with_room<T>(&self, room_id: Uuid, f: impl FnOnce(&mut HashMap<Uuid, Entry>) -> T) -> Option<T> {
        let rooms = self.inner.rooms.read().await;
        let conns = rooms.get(&room_id)?;
        let mut conns = lock(conns);
        Some(f(&mut *conns))
    }

    /// Drops the room's slot once it is empty. Checked again under the write
    /// lock since a register may have slipped in.
    async fn prune(&self, room_id: Uuid) {
        let mut rooms = self.inner.rooms.write().await;
        if rooms.get(&room_id).is_some_and(|conns| lock(conns).is_empty()) {
            rooms.remove(&room_id);
        }
    }

    /// Removes connections matching `pred`, pruning the room when it empties.
    async fn remove_where(&self, room_id: Uuid, pred: impl Fn(&Uuid, &Entry) -> bool) -> usize {
        let outcome = self
            .with_room(room_id, |conns| {
                let before = conns.len();
                conns.retain(|conn_id, entry| !pred(conn_id, entry));
                (before - conns.len(), conns.is_empty())
            })
            .await;
        let Some((removed, empty)) = outcome else {
            return 0;
        };
        if empty {
            self.prune(room_id).await;
        }
        removed
    }

    /// Removes a connection. Returns false if it was already gone.
    pub async fn unregister(&self, conn: &Connection) -> bool {
        let removed = self
            .remove_where(conn.room_id, |conn_id, _| *conn_id == conn.conn_id)
            .await
            > 0;
        if removed {
            debug!(room_id = %conn.room_id, conn_id = %conn.conn_id, "hub: unregistered");
        }
        removed
    }

    /// Queues `event` for every connection in the room on this instance.
    /// Returns how many connections accepted it.
    pub async fn broadcast(&self, room_id: Uuid, event: &ServerEvent) -> usize {
        match serde_json::to_string(event) {
            Ok(json) => self.broadcast_raw(room_id, Utf8Bytes::from(json)).await,
            Err(e) => {
                warn!("hub: failed to encode event for room {}: {}", room_id, e);
                0
            }
        }
    }

    /// Never waits on a slow client: a connection whose queue is full or
    /// closed is dropped from the room instead.
    pub async fn broadcast_raw(&self, room_id: Uuid, payload: Utf8Bytes) -> usize {
        let outcome = self
            .with_room(room_id, |conns| {
                let mut delivered = 0;
                conns.retain(|_, entry| match entry.tx.try_send(payload.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(room_id = %room_id, user_id = %entry.user_id, "hub: outbound queue full, dropping connection");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
                (delivered, conns.is_empty())
            })
            .await;
        let Some((delivered, empty)) = outcome else {
            return 0;
        };
        if empty {
            self.prune(room_id).await;
        }
        delivered
    }

    /// Queues an event for a single connection.
    pub async fn send_to(&self, conn: &Connection, event: &ServerEvent) -> bool {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!("hub: failed to encode event: {}", e);
                return false;
            }
        };
        self.with_room(conn.room_id, |conns| {
            conns
                .get(&conn.conn_id)
                .is_some_and(|entry| entry.tx.try_send(Utf8Bytes::from(json)).is_ok())
        })
        .await
        .unwrap_or(false)
    }

    /// Drops every connection in a room. Writers flush what is already
    /// queued and then close their sockets.
    pub async fn disconnect_room(&self, room_id: Uuid) -> usize {
        let removed = self.inner.rooms.write().await.remove(&room_id);
        removed.map_or(0, |conns| lock(&conns).len())
    }

    /// Drops every local connection one user holds in a room, the same way
    /// [`Hub::disconnect_room`] does for everyone.
    pub async fn disconnect_user(&self, room_id: Uuid, user_id: Uuid) -> usize {
        let removed = self.remove_where(room_id, |_, entry| entry.user_id == user_id).await;
        if removed > 0 {
            debug!(room_id = %room_id, user_id = %user_id, removed, "hub: user disconnected");
        }
        removed
    }

    pub async fn connection_count(&self, room_id: Uuid) -> usize {
        self.with_room(room_id, |conns| conns.len()).await.unwrap_or(0)
    }

    pub async fn is_registered(&self, conn: &Connection) -> bool {
        self.with_room(conn.room_id, |conns| conns.contains_key(&conn.conn_id))
            .await
            .unwrap_or(false)
    }

    /// Distinct users with at least one local connection in the room.
    pub async fn connected_users(&self, room_id: Uuid) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self
            .with_room(room_id, |conns| conns.values().map(|e| e.user_id).collect())
            .await
            .unwrap_or_default();
        users.sort();
        users.dedup();
        users
    }

    /// Rooms with at least one local connection.
    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }
}
