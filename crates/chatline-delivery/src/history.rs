//! Recent-message reads and the enrichment every outgoing message frame gets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use chatline_db::{Store, StoreError};
use chatline_types::events::{MessageView, ReactionView, ReplyPreview};
use chatline_types::models::{ChatMessage, Sticker, UserProfile};

use crate::cache::RoomCache;
use crate::store::MessageStore;

#[derive(Clone)]
pub struct History {
    store: Store,
    messages: Arc<dyn MessageStore>,
    cache: Arc<RoomCache>,
}

impl History {
    pub fn new(store: Store, messages: Arc<dyn MessageStore>, cache: Arc<RoomCache>) -> Self {
        Self {
            store,
            messages,
            cache,
        }
    }

    /// Newest `limit` visible messages in chronological order. Served from
    /// the cache when it holds enough, otherwise merged with the store and
    /// the cache re-warmed.
    pub async fn recent(&self, room_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let cached = self.cache.recent(room_id, limit);
        let visible = cached.iter().filter(|m| !m.unsent).count();
        if visible >= limit {
            return Ok(cached.into_iter().filter(|m| !m.unsent).collect());
        }

        debug!(room_id = %room_id, cached = visible, limit, "history: cache short, reading store");
        let stored = self.messages.recent_messages(room_id, limit).await?;
        self.cache.warm(room_id, &stored);

        // cached copies win, a withdrawal seen on either side sticks
        let mut by_id: HashMap<Uuid, ChatMessage> = stored.into_iter().map(|m| (m.id, m)).collect();
        for mut msg in cached {
            msg.unsent |= by_id.get(&msg.id).is_some_and(|m| m.unsent);
            by_id.insert(msg.id, msg);
        }
        let mut out: Vec<ChatMessage> = by_id.into_values().filter(|m| !m.unsent).collect();
        out.sort_by_key(|m| (m.timestamp, m.id));
        let skip = out.len().saturating_sub(limit);
        out.drain(..skip);
        Ok(out)
    }

    /// A single message from the cache, falling back to the store.
    pub async fn message(&self, room_id: Uuid, message_id: Uuid) -> Result<Option<ChatMessage>, StoreError> {
        if let Some(msg) = self.cache.get(room_id, message_id) {
            return Ok(Some(msg));
        }
        if let Some(msg) = self.messages.message(message_id).await? {
            return Ok(Some(msg).filter(|m| m.room_id == room_id));
        }
        // broadcast moments ago, workers not done yet
        Ok(self
            .store
            .status_payload(message_id)
            .await?
            .filter(|m| m.room_id == room_id))
    }

    /// Attaches author profiles, reactions, reply previews and stickers.
    /// Lookups that fail degrade the view instead of failing it.
    pub async fn enrich(&self, messages: &[ChatMessage]) -> Vec<MessageView> {
        if messages.is_empty() {
            return Vec::new();
        }
        let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();

        let reactions = self.store.reactions_for(ids).await.unwrap_or_else(|e| {
            warn!("history: reactions lookup failed: {}", e);
            Vec::new()
        });

        let mut replies: HashMap<Uuid, ChatMessage> = HashMap::new();
        for msg in messages {
            let Some(target) = msg.body.reply_to() else {
                continue;
            };
            if replies.contains_key(&target) {
                continue;
            }
            match self.message(msg.room_id, target).await {
                Ok(Some(quoted)) => {
                    replies.insert(target, quoted);
                }
                Ok(None) => {}
                Err(e) => warn!(message_id = %target, "history: reply lookup failed: {}", e),
            }
        }

        let mut stickers: HashMap<Uuid, Sticker> = HashMap::new();
        for sticker_id in messages.iter().filter_map(|m| m.body.sticker_id()) {
            if stickers.contains_key(&sticker_id) {
                continue;
            }
            match self.store.sticker(sticker_id).await {
                Ok(Some(sticker)) => {
                    stickers.insert(sticker_id, sticker);
                }
                Ok(None) => {}
                Err(e) => warn!(sticker_id = %sticker_id, "history: sticker lookup failed: {}", e),
            }
        }

        let user_ids: Vec<Uuid> = messages
            .iter()
            .map(|m| m.user_id)
            .chain(reactions.iter().map(|r| r.user_id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let profiles = self.store.profiles(user_ids).await.unwrap_or_else(|e| {
            warn!("history: profile lookup failed: {}", e);
            HashMap::new()
        });
        let profile = |id: Uuid| -> UserProfile {
            profiles
                .get(&id)
                .cloned()
                .unwrap_or_else(|| UserProfile::unknown(id))
        };

        messages
            .iter()
            .map(|msg| {
                let mut view = MessageView::from_message(msg, profile(msg.user_id));
                view.reactions = reactions
                    .iter()
                    .filter(|r| r.message_id == msg.id)
                    .map(|r| ReactionView::new(r, profile(r.user_id).username))
                    .collect();
                view.reply_to = msg
                    .body
                    .reply_to()
                    .and_then(|id| replies.get(&id))
                    .map(|quoted| ReplyPreview {
                        id: quoted.id,
                        user_id: quoted.user_id,
                        text: if quoted.unsent {
                            None
                        } else {
                            quoted.body.text().map(str::to_string)
                        },
                        unsent: quoted.unsent,
                    });
                view.sticker = msg.body.sticker_id().and_then(|id| stickers.get(&id).cloned());
                view
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use chatline_db::Database;
    use chatline_types::models::{MessageBody, MessageReaction};
    use chrono::Utc;
    use std::time::Duration;

    fn setup(window: usize) -> (History, Store, Arc<RoomCache>) {
        let store = Store::new(Arc::new(Database::open_in_memory().unwrap()), Duration::from_secs(1));
        let cache = Arc::new(RoomCache::new(CacheConfig {
            window,
            ..CacheConfig::default()
        }));
        let history = History::new(store.clone(), Arc::new(store.clone()), cache.clone());
        (history, store, cache)
    }

    fn text(room_id: Uuid, user_id: Uuid, n: i64, text: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            room_id,
            user_id,
            body: MessageBody::Text { text: text.into() },
            mentions: vec![],
            unsent: false,
            timestamp: Utc::now() + chrono::Duration::milliseconds(n),
        }
    }

    fn bodies(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().filter_map(|m| m.body.text()).collect()
    }

    #[tokio::test]
    async fn short_cache_falls_back_to_store_and_rewarms() {
        let (history, store, cache) = setup(100);
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        for n in 0..4 {
            store.save_message(&text(room, user, n, &format!("m{n}"))).await.unwrap();
        }
        assert_eq!(cache.len(room), 0);

        let out = history.recent(room, 3).await.unwrap();
        assert_eq!(bodies(&out), vec!["m1", "m2", "m3"]);
        assert_eq!(cache.len(room), 3);

        // second read is served from the cache alone
        let again = history.recent(room, 3).await.unwrap();
        assert_eq!(again, out);
    }

    #[tokio::test]
    async fn messages_evicted_from_cache_come_from_store() {
        let (history, store, cache) = setup(2);
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        for n in 0..5 {
            let msg = text(room, user, n, &format!("m{n}"));
            store.save_message(&msg).await.unwrap();
            cache.append(&msg);
        }
        assert_eq!(bodies(&cache.recent(room, 5)), vec!["m3", "m4"]);

        let out = history.recent(room, 4).await.unwrap();
        assert_eq!(bodies(&out), vec!["m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn unsent_messages_are_hidden() {
        let (history, store, cache) = setup(10);
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        let kept = text(room, user, 0, "kept");
        let gone = text(room, user, 1, "gone");
        for msg in [&kept, &gone] {
            store.save_message(msg).await.unwrap();
            cache.append(msg);
        }
        cache.mark_unsent(room, gone.id);

        let out = history.recent(room, 10).await.unwrap();
        assert_eq!(bodies(&out), vec!["kept"]);
    }

    #[tokio::test]
    async fn enrich_attaches_author_reply_and_reactions() {
        let (history, store, cache) = setup(10);
        let room = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        for (id, name) in [(alice, "alice"), (bob, "bob")] {
            store
                .database()
                .upsert_user(&UserProfile {
                    id,
                    username: name.into(),
                    display_name: None,
                })
                .unwrap();
        }

        let first = text(room, alice, 0, "hello");
        cache.append(&first);
        let reply = ChatMessage {
            body: MessageBody::Reply {
                reply_to: first.id,
                text: "hi back".into(),
            },
            ..text(room, bob, 1, "")
        };
        store
            .save_reaction(&MessageReaction {
                message_id: first.id,
                room_id: room,
                user_id: bob,
                emoji: "👍".into(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let views = history.enrich(&[first.clone(), reply]).await;
        assert_eq!(views[0].author.username, "alice");
        assert_eq!(views[0].reactions.len(), 1);
        assert_eq!(views[0].reactions[0].username, "bob");
        let quoted = views[1].reply_to.as_ref().unwrap();
        assert_eq!(quoted.id, first.id);
        assert_eq!(quoted.text.as_deref(), Some("hello"));

        // unknown authors still render
        let stranger = text(room, Uuid::new_v4(), 2, "who?");
        let views = history.enrich(&[stranger.clone()]).await;
        assert_eq!(views[0].author, UserProfile::unknown(stranger.user_id));
    }
}
