//! Shared wiring for the delivery tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Utf8Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use chatline_db::{Database, Store, StoreError};
use chatline_gateway::backoff::RetryPolicy;
use chatline_gateway::membership::GateConfig;
use chatline_gateway::{Bridge, BrokerError, Connection, Gate, Hub, MemoryBroker};
use chatline_types::events::{NotificationEvent, ServerEvent};
use chatline_types::models::{
    ChatMessage, DeliveryStatus, MessageBody, MessageReaction, MessageReadReceipt, ReactionRemoval, Room, RoomState,
    RoomType, UserProfile,
};

use crate::cache::{CacheConfig, RoomCache};
use crate::notifier::Notifier;
use crate::pipeline::{Accepted, Ingest, Pipeline, PipelineConfig, PipelineDeps, PipelineError};
use crate::store::MessageStore;

/// Real store underneath, with message saves that can be made to fail and
/// are counted either way.
pub struct FlakyStore {
    inner: Store,
    failing: AtomicBool,
    saves: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Store) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn fail_saves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful message saves so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn save_message(&self, msg: &ChatMessage) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database {
                op: "upsert_message",
                source: "disk unplugged".into(),
            });
        }
        self.inner.save_message(msg).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn save_reaction(&self, reaction: &MessageReaction) -> Result<(), StoreError> {
        self.inner.save_reaction(reaction).await
    }

    async fn remove_reaction(&self, removal: &ReactionRemoval) -> Result<(), StoreError> {
        self.inner.remove_reaction(removal).await
    }

    async fn save_receipt(&self, receipt: &MessageReadReceipt) -> Result<bool, StoreError> {
        self.inner.save_receipt(receipt).await
    }

    async fn mark_unsent(&self, message_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        self.inner.mark_unsent(message_id, user_id).await
    }

    async fn message(&self, message_id: Uuid) -> Result<Option<ChatMessage>, StoreError> {
        self.inner.message(message_id).await
    }

    async fn recent_messages(&self, room_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        self.inner.recent_messages(room_id, limit).await
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<NotificationEvent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), BrokerError> {
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct Fixture {
    pub db: Arc<Database>,
    pub store: Store,
    pub hub: Hub,
    pub gate: Gate,
    pub bridge: Bridge,
    pub cache: Arc<RoomCache>,
    pub messages: Arc<FlakyStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub pipeline: Pipeline,
    pub config: PipelineConfig,
}

impl Fixture {
    pub async fn new() -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Store::new(db.clone(), Duration::from_secs(2));
        let hub = Hub::new(64);
        let gate = Gate::new(Arc::new(store.clone()), GateConfig::default());
        let bridge = Bridge::new("test-node", Arc::new(MemoryBroker::default()), hub.clone(), gate.clone());
        let cache = Arc::new(RoomCache::new(CacheConfig::default()));
        let messages = Arc::new(FlakyStore::new(store.clone()));
        let notifier = Arc::new(RecordingNotifier::default());
        let config = PipelineConfig {
            workers: 4,
            queue_size: 64,
            retry: RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                factor: 2,
            },
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::start(
            PipelineDeps {
                store: store.clone(),
                messages: messages.clone(),
                cache: cache.clone(),
                notifier: notifier.clone(),
                gate: gate.clone(),
                bridge: bridge.clone(),
            },
            config.clone(),
        );

        Self {
            db,
            store,
            hub,
            gate,
            bridge,
            cache,
            messages,
            notifier,
            pipeline,
            config,
        }
    }

    pub fn room(&self, room_type: RoomType) -> Uuid {
        let id = Uuid::new_v4();
        self.db
            .create_room(&Room {
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

    pub fn user(&self, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.db
            .upsert_user(&UserProfile {
                id,
                username: username.into(),
                display_name: None,
            })
            .unwrap();
        id
    }

    pub async fn connect(&self, room_id: Uuid, user_id: Uuid) -> (Connection, mpsc::Receiver<Utf8Bytes>) {
        self.gate.validate_and_track(room_id, user_id).await.unwrap();
        self.hub.register(room_id, user_id).await
    }

    pub async fn say(&self, room_id: Uuid, user_id: Uuid, text: &str) -> Result<Accepted, PipelineError> {
        self.pipeline
            .ingest(Ingest::Message {
                room_id,
                user_id,
                body: MessageBody::Text { text: text.into() },
            })
            .await
    }

    pub async fn eventually(&self, mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    pub async fn wait_for(&self, message_id: Uuid, done: impl Fn(&DeliveryStatus) -> bool) -> DeliveryStatus {
        for _ in 0..200 {
            if let Some(status) = self.store.status(message_id).await.unwrap() {
                if done(&status) {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status of {message_id} never reached the expected state");
    }

    pub async fn wait_completed(&self, message_id: Uuid) -> DeliveryStatus {
        self.wait_for(message_id, |s| {
            s.status == chatline_types::models::DeliveryState::Completed
        })
        .await
    }
}

/// Drains and decodes every frame queued for one connection.
pub fn frames(rx: &mut mpsc::Receiver<Utf8Bytes>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(raw) = rx.try_recv() {
        out.push(serde_json::from_str(raw.as_str()).unwrap());
    }
    out
}
