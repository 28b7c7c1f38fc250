//! Binds broker subscriptions to local room occupancy: one consumer task
//! per room with at least one connection on this instance.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use chatline_types::events::{RoomBroadcast, ServerEvent};
use chatline_types::room_topic;

use crate::backoff::RetryPolicy;
use crate::broker::{Broker, BrokerError};
use crate::hub::Hub;
use crate::membership::Gate;

/// How long the first caller waits for the broker subscription to open.
const SUBSCRIBE_WAIT: Duration = Duration::from_secs(2);

struct Subscription {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    node_id: String,
    broker: Arc<dyn Broker>,
    hub: Hub,
    gate: Gate,
    backoff: RetryPolicy,
    subs: Mutex<HashMap<Uuid, Subscription>>,
}

impl Bridge {
    pub fn new(node_id: impl Into<String>, broker: Arc<dyn Broker>, hub: Hub, gate: Gate) -> Self {
        Self::with_backoff(
            node_id,
            broker,
            hub,
            gate,
            RetryPolicy {
                max_retries: u32::MAX,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                factor: 2,
            },
        )
    }

    pub fn with_backoff(
        node_id: impl Into<String>,
        broker: Arc<dyn Broker>,
        hub: Hub,
        gate: Gate,
        backoff: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                node_id: node_id.into(),
                broker,
                hub,
                gate,
                backoff,
                subs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    fn subs(&self) -> MutexGuard<'_, HashMap<Uuid, Subscription>> {
        self.inner
            .subs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts the room's consumer unless one is already running. Returns
    /// true for the caller that started it; that caller also waits briefly
    /// for the broker subscription to open.
    pub async fn ensure_subscribed(&self, room_id: Uuid) -> bool {
        let ready = {
            let mut subs = self.subs();
            let Entry::Vacant(slot) = subs.entry(room_id) else {
                return false;
            };
            let cancel = CancellationToken::new();
            let (ready_tx, ready_rx) = oneshot::channel();
            let handle = tokio::spawn(consume(
                self.inner.clone(),
                room_id,
                cancel.clone(),
                ready_tx,
            ));
            slot.insert(Subscription {
                cancel,
                _handle: handle,
            });
            ready_rx
        };

        info!("bridge: subscribed to room {}", room_id);
        if tokio::time::timeout(SUBSCRIBE_WAIT, ready).await.is_err() {
            warn!("bridge: room {} subscription still opening after {:?}", room_id, SUBSCRIBE_WAIT);
        }
        true
    }

    /// Stops the room's consumer if no local connection is left. The check
    /// and the stop happen under the gate's room lock.
    pub fn release_if_empty(&self, room_id: Uuid) -> bool {
        let released = self
            .inner
            .gate
            .when_vacant(room_id, || {
                self.subs().remove(&room_id).map(|sub| sub.cancel.cancel())
            })
            .flatten()
            .is_some();
        if released {
            info!("bridge: released room {}", room_id);
        }
        released
    }

    pub fn is_subscribed(&self, room_id: Uuid) -> bool {
        self.subs().contains_key(&room_id)
    }

    pub fn active_rooms(&self) -> usize {
        self.subs().len()
    }

    /// Delivers to local connections, then publishes for other instances.
    /// A publish failure does not undo the local delivery.
    pub async fn fan_out(&self, room_id: Uuid, event: ServerEvent) -> Result<usize, BrokerError> {
        let delivered = self.inner.hub.broadcast(room_id, &event).await;
        let envelope = RoomBroadcast {
            origin: self.inner.node_id.clone(),
            room_id,
            event,
        };
        let payload = Bytes::from(serde_json::to_vec(&envelope)?);
        self.inner
            .broker
            .publish(&room_topic(room_id), payload)
            .await?;
        Ok(delivered)
    }

    /// Cancels every consumer.
    pub fn shutdown(&self) {
        let mut subs = self.subs();
        for (_, sub) in subs.drain() {
            sub.cancel.cancel();
        }
    }
}

async fn consume(
    inner: Arc<BridgeInner>,
    room_id: Uuid,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
) {
    let topic = room_topic(room_id);
    let mut ready = Some(ready);
    let mut attempt: u32 = 0;

    loop {
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return,
            res = inner.broker.subscribe(&topic) => res,
        };

        let mut stream = match subscribed {
            Ok(stream) => {
                attempt = 0;
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }
                stream
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                let delay = inner.backoff.jittered(attempt);
                warn!(topic = %topic, attempt, "bridge: subscribe failed: {}, retrying in {:?}", e, delay);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(topic = %topic, "bridge: consumer stopped");
                    return;
                }
                item = stream.next() => item,
            };
            match item {
                Some(Ok(bytes)) => deliver(&inner, room_id, &bytes).await,
                Some(Err(e)) => warn!(topic = %topic, "bridge: consumer error: {}", e),
                None => {
                    warn!(topic = %topic, "bridge: subscription closed, resubscribing");
                    break;
                }
            }
        }

        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.backoff.jittered(attempt)) => {}
        }
    }
}

async fn deliver(inner: &BridgeInner, room_id: Uuid, bytes: &[u8]) {
    let envelope: RoomBroadcast = match serde_json::from_slice(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(room_id = %room_id, "bridge: undecodable broker message: {}", e);
            return;
        }
    };
    if envelope.origin == inner.node_id {
        // already delivered locally when it was produced
        return;
    }
    if envelope.room_id != room_id {
        warn!(room_id = %room_id, other = %envelope.room_id, "bridge: message for another room on topic");
        return;
    }

    let delivered = inner.hub.broadcast(room_id, &envelope.event).await;
    trace!(room_id = %room_id, origin = %envelope.origin, delivered, "bridge: relayed");
    match envelope.event {
        ServerEvent::RoomDeactivated { .. } => {
            inner.hub.disconnect_room(room_id).await;
        }
        ServerEvent::Kicked { user_id, .. } => {
            inner.hub.disconnect_user(room_id, user_id).await;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::membership::{GateConfig, RoomDirectory};
    use async_trait::async_trait;
    use chatline_db::StoreError;
    use chatline_types::models::{MemberAccess, Room, RoomState, RoomType};
    use chrono::{DateTime, Utc};

    /// Every room exists and is open.
    struct OpenRooms;

    #[async_trait]
    impl RoomDirectory for OpenRooms {
        async fn room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
            Ok(Some(Room {
                id: room_id,
                name: "r".into(),
                room_type: RoomType::Open,
                state: RoomState::Active,
                capacity: None,
                updated_at: Utc::now(),
            }))
        }
        async fn access(&self, _: Uuid, _: Uuid) -> Result<MemberAccess, StoreError> {
            Ok(MemberAccess::default())
        }
        async fn member_count(&self, _: Uuid) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn last_active(&self, _: Uuid) -> Result<Option<DateTime<Utc>>, StoreError> {
            Ok(None)
        }
    }

    fn node(name: &str, broker: Arc<MemoryBroker>) -> (Bridge, Hub, Gate) {
        let hub = Hub::new(16);
        let gate = Gate::new(Arc::new(OpenRooms), GateConfig::default());
        let bridge = Bridge::new(name, broker, hub.clone(), gate.clone());
        (bridge, hub, gate)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn concurrent_connects_start_one_consumer() {
        let broker = Arc::new(MemoryBroker::new(64));
        let (bridge, _hub, gate) = node("a", broker.clone());
        let room = Uuid::new_v4();

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let (bridge, gate) = (bridge.clone(), gate.clone());
            tasks.push(tokio::spawn(async move {
                gate.validate_and_track(room, Uuid::new_v4()).await.unwrap();
                bridge.ensure_subscribed(room).await
            }));
        }
        let mut started = 0;
        for task in tasks {
            if task.await.unwrap() {
                started += 1;
            }
        }

        assert_eq!(started, 1);
        assert_eq!(bridge.active_rooms(), 1);
        assert_eq!(broker.subscriber_count(&room_topic(room)), 1);
    }

    #[tokio::test]
    async fn last_leave_releases_and_next_connect_resubscribes() {
        let broker = Arc::new(MemoryBroker::new(64));
        let (bridge, _hub, gate) = node("a", broker.clone());
        let room = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        for user in [alice, bob] {
            gate.validate_and_track(room, user).await.unwrap();
            bridge.ensure_subscribed(room).await;
        }

        gate.remove_connection(room, alice);
        assert!(!bridge.release_if_empty(room));
        assert!(bridge.is_subscribed(room));
        assert_eq!(gate.active_connections(room), 1);

        gate.remove_connection(room, bob);
        assert!(bridge.release_if_empty(room));
        assert!(!bridge.is_subscribed(room));
        assert!(eventually(|| broker.subscriber_count(&room_topic(room)) == 0).await);

        gate.validate_and_track(room, alice).await.unwrap();
        assert!(bridge.ensure_subscribed(room).await);
        assert_eq!(broker.subscriber_count(&room_topic(room)), 1);
    }

    #[tokio::test]
    async fn fan_out_reaches_other_instances_once() {
        let broker = Arc::new(MemoryBroker::new(64));
        let (bridge_a, hub_a, gate_a) = node("a", broker.clone());
        let (bridge_b, hub_b, gate_b) = node("b", broker.clone());
        let room = Uuid::new_v4();

        gate_a.validate_and_track(room, Uuid::new_v4()).await.unwrap();
        bridge_a.ensure_subscribed(room).await;
        let (_, mut rx_a) = hub_a.register(room, Uuid::new_v4()).await;

        gate_b.validate_and_track(room, Uuid::new_v4()).await.unwrap();
        bridge_b.ensure_subscribed(room).await;
        let (_, mut rx_b) = hub_b.register(room, Uuid::new_v4()).await;

        let delivered = bridge_a
            .fan_out(room, ServerEvent::error("x", "hello"))
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let frame = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.as_str().contains("hello"));

        assert!(rx_a.recv().await.unwrap().as_str().contains("hello"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err(), "own broadcast must not come back");
    }

    #[tokio::test]
    async fn remote_deactivation_disconnects_local_clients() {
        let broker = Arc::new(MemoryBroker::new(64));
        let (bridge_a, _, _) = node("a", broker.clone());
        let (bridge_b, hub_b, gate_b) = node("b", broker.clone());
        let room = Uuid::new_v4();

        gate_b.validate_and_track(room, Uuid::new_v4()).await.unwrap();
        bridge_b.ensure_subscribed(room).await;
        let (_, mut rx_b) = hub_b.register(room, Uuid::new_v4()).await;

        bridge_a
            .fan_out(
                room,
                ServerEvent::RoomDeactivated {
                    room_id: room,
                    reason: "closed".into(),
                },
            )
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.as_str().contains("room_deactivated"));
        assert!(rx_b.recv().await.is_none());
    }

    #[tokio::test]
    async fn remote_kick_drops_only_that_user() {
        let broker = Arc::new(MemoryBroker::new(64));
        let (bridge_a, _, _) = node("a", broker.clone());
        let (bridge_b, hub_b, gate_b) = node("b", broker.clone());
        let (room, kicked, other) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        gate_b.validate_and_track(room, kicked).await.unwrap();
        bridge_b.ensure_subscribed(room).await;
        let (_, mut rx_kicked) = hub_b.register(room, kicked).await;
        let (other_conn, mut rx_other) = hub_b.register(room, other).await;

        bridge_a
            .fan_out(
                room,
                ServerEvent::Kicked {
                    room_id: room,
                    user_id: kicked,
                    banned: false,
                },
            )
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), rx_kicked.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.as_str().contains("kicked"));
        assert!(rx_kicked.recv().await.is_none());

        assert!(rx_other.recv().await.unwrap().as_str().contains("kicked"));
        assert!(hub_b.is_registered(&other_conn).await);
    }
}
