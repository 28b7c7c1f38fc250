//! Accepts client sends, shows them live, then completes the durable side
//! effects on a bounded worker pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chatline_db::{Store, StoreError};
use chatline_gateway::backoff::RetryPolicy;
use chatline_gateway::{Bridge, Denial, Gate, SendKind};
use chatline_types::api::PoolStatus;
use chatline_types::commands::mention_tokens;
use chatline_types::events::{NotificationEvent, NotificationKind, ReactionView, ServerEvent};
use chatline_types::models::{
    ChatMessage, DeliveryStep, MessageBody, MessageReaction, MessageReadReceipt, ReactionRemoval,
};

use crate::cache::RoomCache;
use crate::history::History;
use crate::notifier::{self, Notifier};
use crate::retry::with_retry;
use crate::store::MessageStore;

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub retry: RetryPolicy,
    /// Longest accepted message text, in characters.
    pub max_text_len: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_size: 1000,
            retry: RetryPolicy::default(),
            max_text_len: 4000,
        }
    }
}

/// Something a connected client wants to add to a room.
#[derive(Debug, Clone)]
pub enum Ingest {
    Message {
        room_id: Uuid,
        user_id: Uuid,
        body: MessageBody,
    },
    Reaction {
        room_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
        emoji: String,
    },
    Unreact {
        room_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
    },
    Receipt {
        room_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
    },
    Unsend {
        room_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
    },
}

/// What an ingest produced once it was accepted and fanned out.
#[derive(Debug, Clone)]
pub enum Accepted {
    Message(ChatMessage),
    Reaction(MessageReaction),
    ReactionRemoved(ReactionRemoval),
    Receipt(MessageReadReceipt),
    Unsent { message_id: Uuid },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Denied(#[from] Denial),
    #[error("only the author can unsend a message")]
    NotAuthor,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid_message",
            Self::Denied(denial) => denial.code(),
            Self::NotAuthor => "not_author",
            Self::Store(_) => "unavailable",
        }
    }
}

enum Job {
    Step { step: DeliveryStep, msg: ChatMessage },
    Reaction(MessageReaction),
    Unreact(ReactionRemoval),
    Receipt(MessageReadReceipt),
    Unsend(ChatMessage),
}

impl Job {
    fn label(&self) -> &'static str {
        match self {
            Self::Step { step: DeliveryStep::Store, .. } => "save_message",
            Self::Step { step: DeliveryStep::Cache, .. } => "cache_message",
            Self::Step { step: DeliveryStep::Notify, .. } => "notify",
            Self::Reaction(_) => "save_reaction",
            Self::Unreact(_) => "remove_reaction",
            Self::Receipt(_) => "save_receipt",
            Self::Unsend(_) => "unsend",
        }
    }
}

/// Everything the pipeline talks to.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Store,
    pub messages: Arc<dyn MessageStore>,
    pub cache: Arc<RoomCache>,
    pub notifier: Arc<dyn Notifier>,
    pub gate: Gate,
    pub bridge: Bridge,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    deps: PipelineDeps,
    history: History,
    config: PipelineConfig,
    jobs: mpsc::Sender<Job>,
    /// Last timestamp handed out per room.
    clocks: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    completed: AtomicU64,
    failed: AtomicU64,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Builds the pipeline and spawns its workers on the current runtime.
    pub fn start(deps: PipelineDeps, config: PipelineConfig) -> Self {
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let history = History::new(deps.store.clone(), deps.messages.clone(), deps.cache.clone());

        let pipeline = Self {
            inner: Arc::new(PipelineInner {
                deps,
                history,
                config: PipelineConfig { workers, ..config },
                jobs: tx,
                clocks: Mutex::new(HashMap::new()),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        };

        for worker_id in 0..workers {
            let this = pipeline.clone();
            let rx = rx.clone();
            pipeline
                .inner
                .tracker
                .spawn(async move { this.worker(worker_id, rx).await });
        }
        pipeline.inner.tracker.close();
        info!("pipeline: started {} workers", workers);
        pipeline
    }

    pub fn history(&self) -> &History {
        &self.inner.history
    }

    /// Validates, fans out and queues the side effects. Returns once the
    /// live broadcast happened; persistence continues in the background.
    pub async fn ingest(&self, ingest: Ingest) -> Result<Accepted, PipelineError> {
        match ingest {
            Ingest::Message {
                room_id,
                user_id,
                body,
            } => self.ingest_message(room_id, user_id, body).await,
            Ingest::Reaction {
                room_id,
                user_id,
                message_id,
                emoji,
            } => self.ingest_reaction(room_id, user_id, message_id, emoji).await,
            Ingest::Unreact {
                room_id,
                user_id,
                message_id,
            } => self.ingest_unreact(room_id, user_id, message_id).await,
            Ingest::Receipt {
                room_id,
                user_id,
                message_id,
            } => self.ingest_receipt(room_id, user_id, message_id).await,
            Ingest::Unsend {
                room_id,
                user_id,
                message_id,
            } => self.ingest_unsend(room_id, user_id, message_id).await,
        }
    }

    fn validate_body(&self, body: &MessageBody) -> Result<(), PipelineError> {
        let text = match body {
            MessageBody::Text { text } | MessageBody::Reply { text, .. } => Some(text.as_str()),
            MessageBody::File { file, caption } => {
                if file.url.trim().is_empty() {
                    return Err(PipelineError::Invalid("file reference has no url".into()));
                }
                caption.as_deref()
            }
            MessageBody::Sticker { .. } => None,
        };
        match text {
            Some(t) if t.trim().is_empty() && !matches!(body, MessageBody::File { .. }) => {
                Err(PipelineError::Invalid("message is empty".into()))
            }
            Some(t) if t.chars().count() > self.inner.config.max_text_len => Err(PipelineError::Invalid(format!(
                "message longer than {} characters",
                self.inner.config.max_text_len
            ))),
            _ => Ok(()),
        }
    }

    async fn ingest_message(&self, room_id: Uuid, user_id: Uuid, body: MessageBody) -> Result<Accepted, PipelineError> {
        let deps = &self.inner.deps;
        self.validate_body(&body)?;

        let kind = match body {
            MessageBody::Sticker { .. } => SendKind::Sticker,
            _ => SendKind::Message,
        };
        deps.gate.check_send(room_id, user_id, kind).await?;

        if let Some(sticker_id) = body.sticker_id() {
            if deps.store.sticker(sticker_id).await?.is_none() {
                return Err(PipelineError::Invalid(format!("unknown sticker {sticker_id}")));
            }
        }
        if let Some(target) = body.reply_to() {
            match self.inner.history.message(room_id, target).await? {
                Some(quoted) if !quoted.unsent => {}
                _ => return Err(PipelineError::Invalid(format!("message {target} not found in this room"))),
            }
        }

        let mentions = self.resolve_mentions(body.text().unwrap_or_default()).await;
        let msg = ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            user_id,
            body,
            mentions,
            unsent: false,
            timestamp: self.next_timestamp(room_id),
        };

        // without a status row a lost write could never be found again
        deps.store.create_status(&msg, Utc::now()).await?;

        let view = self
            .inner
            .history
            .enrich(std::slice::from_ref(&msg))
            .await
            .into_iter()
            .next();
        if let Some(view) = view {
            self.fan_out(room_id, ServerEvent::Message(view)).await;
        }

        for step in DeliveryStep::ALL {
            self.enqueue(Job::Step {
                step,
                msg: msg.clone(),
            });
        }
        debug!(message_id = %msg.id, room_id = %room_id, kind = msg.body.kind(), "pipeline: message accepted");
        Ok(Accepted::Message(msg))
    }

    async fn ingest_reaction(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
        emoji: String,
    ) -> Result<Accepted, PipelineError> {
        let deps = &self.inner.deps;
        let emoji = emoji.trim().to_string();
        if emoji.is_empty() || emoji.chars().count() > 32 {
            return Err(PipelineError::Invalid("invalid emoji".into()));
        }
        deps.gate.check_send(room_id, user_id, SendKind::Reaction).await?;
        match self.inner.history.message(room_id, message_id).await? {
            Some(target) if !target.unsent => {}
            _ => return Err(PipelineError::Invalid(format!("message {message_id} not found in this room"))),
        }

        let reaction = MessageReaction {
            message_id,
            room_id,
            user_id,
            emoji,
            timestamp: Utc::now(),
        };
        let username = match deps.store.profiles(vec![user_id]).await {
            Ok(mut profiles) => profiles.remove(&user_id).map(|p| p.username).unwrap_or_default(),
            Err(e) => {
                warn!(user_id = %user_id, "pipeline: profile lookup failed: {}", e);
                String::new()
            }
        };
        self.fan_out(room_id, ServerEvent::Reaction(ReactionView::new(&reaction, username)))
            .await;
        self.enqueue(Job::Reaction(reaction.clone()));
        Ok(Accepted::Reaction(reaction))
    }

    async fn ingest_unreact(&self, room_id: Uuid, user_id: Uuid, message_id: Uuid) -> Result<Accepted, PipelineError> {
        // taking one's own reaction back needs presence, not send rights
        if !self.inner.deps.gate.is_user_in_room(room_id, user_id) {
            return Err(Denial::NotInRoom.into());
        }
        if self.inner.history.message(room_id, message_id).await?.is_none() {
            return Err(PipelineError::Invalid(format!("message {message_id} not found in this room")));
        }

        let removal = ReactionRemoval {
            message_id,
            room_id,
            user_id,
            timestamp: Utc::now(),
        };
        self.fan_out(room_id, ServerEvent::ReactionRemoved { message_id, user_id })
            .await;
        self.enqueue(Job::Unreact(removal));
        Ok(Accepted::ReactionRemoved(removal))
    }

    async fn ingest_receipt(&self, room_id: Uuid, user_id: Uuid, message_id: Uuid) -> Result<Accepted, PipelineError> {
        // reading needs no send permission, only presence
        if !self.inner.deps.gate.is_user_in_room(room_id, user_id) {
            return Err(Denial::NotInRoom.into());
        }
        if self.inner.history.message(room_id, message_id).await?.is_none() {
            return Err(PipelineError::Invalid(format!("message {message_id} not found in this room")));
        }

        let receipt = MessageReadReceipt {
            message_id,
            room_id,
            user_id,
            timestamp: Utc::now(),
        };
        self.fan_out(
            room_id,
            ServerEvent::Read {
                message_id,
                user_id,
                timestamp: receipt.timestamp,
            },
        )
        .await;
        self.enqueue(Job::Receipt(receipt.clone()));
        Ok(Accepted::Receipt(receipt))
    }

    async fn ingest_unsend(&self, room_id: Uuid, user_id: Uuid, message_id: Uuid) -> Result<Accepted, PipelineError> {
        let deps = &self.inner.deps;
        if !deps.gate.is_user_in_room(room_id, user_id) {
            return Err(Denial::NotInRoom.into());
        }
        let Some(msg) = self.inner.history.message(room_id, message_id).await? else {
            return Err(PipelineError::Invalid(format!("message {message_id} not found in this room")));
        };
        if msg.user_id != user_id {
            return Err(PipelineError::NotAuthor);
        }
        if msg.unsent {
            return Ok(Accepted::Unsent { message_id });
        }

        let withdrawn = ChatMessage { unsent: true, ..msg };
        // upsert rather than flag: the cache step for this message may not
        // have run yet, and a later append keeps the flag
        deps.cache.append(&withdrawn);
        self.fan_out(room_id, ServerEvent::Unsend { message_id, user_id })
            .await;
        self.enqueue(Job::Unsend(withdrawn));
        Ok(Accepted::Unsent { message_id })
    }

    async fn resolve_mentions(&self, text: &str) -> Vec<Uuid> {
        let tokens: Vec<String> = mention_tokens(text).into_iter().map(str::to_string).collect();
        if tokens.is_empty() {
            return Vec::new();
        }
        match self.inner.deps.store.users_by_username(tokens).await {
            Ok(users) => users.into_iter().map(|u| u.id).collect(),
            Err(e) => {
                warn!("pipeline: mention lookup failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Wall clock, never earlier than the previous message in the room.
    fn next_timestamp(&self, room_id: Uuid) -> DateTime<Utc> {
        let now = Utc::now();
        let mut clocks = self
            .inner
            .clocks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let last = clocks
            .get(&room_id)
            .copied()
            .or_else(|| self.inner.deps.cache.latest_timestamp(room_id));
        let ts = last.map_or(now, |last| last.max(now));
        clocks.insert(room_id, ts);
        ts
    }

    async fn fan_out(&self, room_id: Uuid, event: ServerEvent) {
        if let Err(e) = self.inner.deps.bridge.fan_out(room_id, event).await {
            warn!(room_id = %room_id, "pipeline: publish failed, local delivery only: {}", e);
        }
    }

    fn enqueue(&self, job: Job) {
        let label = job.label();
        match self.inner.jobs.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job = label, "pipeline: queue full, leaving job to the reconciler");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(job = label, "pipeline: queue closed, leaving job to the reconciler");
            }
        }
    }

    async fn worker(&self, worker_id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
        loop {
            let job = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = self.inner.cancel.cancelled() => None,
                    job = rx.recv() => job,
                }
            };
            let Some(job) = job else {
                debug!(worker_id, "pipeline: worker stopping");
                return;
            };
            self.run(job).await;
        }
    }

    async fn run(&self, job: Job) {
        let ok = match job {
            Job::Step { step, msg } => self.redrive(step, &msg).await,
            Job::Reaction(reaction) => self.retry_side_effect("save_reaction", || {
                let messages = self.inner.deps.messages.clone();
                let reaction = reaction.clone();
                async move { messages.save_reaction(&reaction).await.map_err(|e| e.to_string()) }
            })
            .await
            .is_ok(),
            Job::Unreact(removal) => self.retry_side_effect("remove_reaction", || {
                let messages = self.inner.deps.messages.clone();
                async move { messages.remove_reaction(&removal).await.map_err(|e| e.to_string()) }
            })
            .await
            .is_ok(),
            Job::Receipt(receipt) => self.retry_side_effect("save_receipt", || {
                let messages = self.inner.deps.messages.clone();
                let receipt = receipt.clone();
                async move { messages.save_receipt(&receipt).await.map(|_| ()).map_err(|e| e.to_string()) }
            })
            .await
            .is_ok(),
            Job::Unsend(msg) => self.persist_unsend(&msg).await,
        };
        let counter = if ok {
            &self.inner.completed
        } else {
            &self.inner.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    async fn retry_side_effect<F, Fut>(&self, op: &'static str, f: F) -> Result<(), String>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        with_retry(&self.inner.config.retry, op, f).await.map_err(|exhausted| {
            error!(op, attempts = exhausted.attempts, "pipeline: giving up: {}", exhausted.error);
            exhausted.error
        })
    }

    async fn persist_unsend(&self, msg: &ChatMessage) -> bool {
        let deps = &self.inner.deps;
        let result = self
            .retry_side_effect("unsend", || {
                let messages = deps.messages.clone();
                let msg = msg.clone();
                async move {
                    if messages
                        .mark_unsent(msg.id, msg.user_id)
                        .await
                        .map_err(|e| e.to_string())?
                    {
                        return Ok(());
                    }
                    // not stored yet: store it withdrawn, later saves keep the flag
                    messages.save_message(&msg).await.map_err(|e| e.to_string())
                }
            })
            .await;
        if let Err(e) = deps.store.update_status_payload(msg).await {
            debug!(message_id = %msg.id, "pipeline: status payload not updated: {}", e);
        }
        result.is_ok()
    }

    async fn perform(&self, step: DeliveryStep, msg: &ChatMessage) -> Result<(), String> {
        let deps = &self.inner.deps;
        match step {
            DeliveryStep::Store => deps.messages.save_message(msg).await.map_err(|e| e.to_string()),
            DeliveryStep::Cache => {
                deps.cache.append(msg);
                Ok(())
            }
            DeliveryStep::Notify => self.notify(msg).await,
        }
    }

    async fn notify(&self, msg: &ChatMessage) -> Result<(), String> {
        let deps = &self.inner.deps;
        let members = deps
            .store
            .member_ids(msg.room_id)
            .await
            .map_err(|e| e.to_string())?;
        let online = deps.gate.active_users(msg.room_id);
        let recipients = notifier::recipients(&members, &online, &msg.mentions, msg.user_id);
        if recipients.is_empty() {
            return Ok(());
        }

        let event = NotificationEvent {
            message_id: msg.id,
            room_id: msg.room_id,
            sender_id: msg.user_id,
            recipients,
            kind: if msg.mentions.is_empty() {
                NotificationKind::Message
            } else {
                NotificationKind::Mention
            },
            preview: notifier::preview(msg.body.text(), PREVIEW_CHARS),
            timestamp: msg.timestamp,
        };
        match tokio::time::timeout(deps.store.timeout(), deps.notifier.notify(&event)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("notify timed out after {:?}", deps.store.timeout())),
        }
    }

    /// Performs one delivery step with retries and records the outcome on
    /// the message's status document. Safe to repeat.
    pub async fn redrive(&self, step: DeliveryStep, msg: &ChatMessage) -> bool {
        let deps = &self.inner.deps;
        let label = match step {
            DeliveryStep::Store => "save_message",
            DeliveryStep::Cache => "cache_message",
            DeliveryStep::Notify => "notify",
        };

        match with_retry(&self.inner.config.retry, label, || self.perform(step, msg)).await {
            Ok(()) => {
                let marked = with_retry(&self.inner.config.retry, "mark_step", || deps.store.mark_step(msg.id, step)).await;
                match marked {
                    Ok(state) => {
                        debug!(message_id = %msg.id, %step, ?state, "pipeline: step done");
                        true
                    }
                    Err(e) => {
                        // the step itself is done; the reconciler will flip the flag
                        error!(message_id = %msg.id, %step, "pipeline: could not record step: {}", e.error);
                        false
                    }
                }
            }
            Err(exhausted) => {
                error!(
                    message_id = %msg.id,
                    %step,
                    attempts = exhausted.attempts,
                    "pipeline: step failed: {}",
                    exhausted.error
                );
                if let Err(e) = deps
                    .store
                    .record_failure(msg.id, step, exhausted.error, exhausted.attempts)
                    .await
                {
                    error!(message_id = %msg.id, "pipeline: could not record failure: {}", e);
                }
                false
            }
        }
    }

    pub fn pool_status(&self) -> PoolStatus {
        let jobs = &self.inner.jobs;
        PoolStatus {
            worker_count: self.inner.config.workers,
            jobs_queued: jobs.max_capacity() - jobs.capacity(),
            queue_capacity: jobs.max_capacity(),
            jobs_completed: self.inner.completed.load(Ordering::Relaxed),
            jobs_failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops the workers. Jobs still queued stay pending for the reconciler.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.cancel.cancel();
        if tokio::time::timeout(grace, self.inner.tracker.wait()).await.is_err() {
            warn!("pipeline: workers still busy after {:?}", grace);
        }
    }
}
