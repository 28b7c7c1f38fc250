//! Off-band notifications for users who are not watching the room.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use chatline_gateway::{Broker, BrokerError};
use chatline_types::NOTIFICATIONS_TOPIC;
use chatline_types::events::NotificationEvent;

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), BrokerError>;
}

/// Publishes notification events on the shared notifications topic.
pub struct BrokerNotifier {
    broker: Arc<dyn Broker>,
}

impl BrokerNotifier {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Notifier for BrokerNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), BrokerError> {
        let payload = Bytes::from(serde_json::to_vec(event)?);
        self.broker.publish(NOTIFICATIONS_TOPIC, payload).await?;
        debug!(
            message_id = %event.message_id,
            recipients = event.recipients.len(),
            "notification published"
        );
        Ok(())
    }
}

/// Members not connected here, plus everyone mentioned, minus the author.
/// Order follows `members` then `mentions`, without duplicates.
pub fn recipients(members: &[Uuid], online: &[Uuid], mentions: &[Uuid], author: Uuid) -> Vec<Uuid> {
    let online: HashSet<&Uuid> = online.iter().collect();
    let mut seen = HashSet::new();
    members
        .iter()
        .filter(|id| !online.contains(id))
        .chain(mentions.iter())
        .filter(|id| **id != author)
        .filter(|id| seen.insert(**id))
        .copied()
        .collect()
}

/// First characters of the text shown in the notification.
pub fn preview(text: Option<&str>, max_chars: usize) -> String {
    let text = text.unwrap_or_default().trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
