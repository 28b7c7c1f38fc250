//! Topic pub/sub transport between server instances.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("subscriber on {topic} lagged, {skipped} messages lost")]
    Lagged { topic: String, skipped: u64 },
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type BrokerStream = Pin<Box<dyn Stream<Item = Result<Bytes, BrokerError>> + Send>>;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publishes to a topic, creating it on demand. Publishing to a topic
    /// nobody listens on is not an error.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Opens a subscription. The stream ends if the broker drops it.
    async fn subscribe(&self, topic: &str) -> Result<BrokerStream, BrokerError>;
}

/// Single-process broker: one broadcast channel per topic.
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    buffer_size: usize,
}

impl MemoryBroker {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    fn sender(&self, topic: &str) -> Result<broadcast::Sender<Bytes>, BrokerError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|e| BrokerError::Unavailable(format!("topic lock poisoned: {e}")))?;
        Ok(topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .clone())
    }

    /// Live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .map(|topics| topics.get(topic).map_or(0, |tx| tx.receiver_count()))
            .unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let tx = self.sender(topic)?;
        // Err only means no subscriber right now
        let reached = tx.send(payload).unwrap_or(0);
        trace!(topic, reached, "broker: published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BrokerStream, BrokerError> {
        let rx = self.sender(topic)?.subscribe();
        let topic = topic.to_string();
        let stream = futures_util::stream::unfold((rx, topic), |(mut rx, topic)| async move {
            match rx.recv().await {
                Ok(bytes) => Some((Ok(bytes), (rx, topic))),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let err = BrokerError::Lagged {
                        topic: topic.clone(),
                        skipped,
                    };
                    Some((Err(err), (rx, topic)))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn subscribers_receive_published_payloads() {
        let broker = MemoryBroker::new(16);
        let mut a = broker.subscribe("chat-room-1").await.unwrap();
        let mut b = broker.subscribe("chat-room-1").await.unwrap();
        assert_eq!(broker.subscriber_count("chat-room-1"), 2);

        broker.publish("chat-room-1", Bytes::from_static(b"hi")).await.unwrap();
        broker.publish("chat-room-2", Bytes::from_static(b"elsewhere")).await.unwrap();

        assert_eq!(a.next().await.unwrap().unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(b.next().await.unwrap().unwrap(), Bytes::from_static(b"hi"));

        drop(a);
        assert_eq!(broker.subscriber_count("chat-room-1"), 1);
    }

    #[tokio::test]
    async fn lag_is_reported_not_fatal() {
        let broker = MemoryBroker::new(1);
        let mut sub = broker.subscribe("t").await.unwrap();
        broker.publish("t", Bytes::from_static(b"1")).await.unwrap();
        broker.publish("t", Bytes::from_static(b"2")).await.unwrap();

        assert!(matches!(sub.next().await, Some(Err(BrokerError::Lagged { .. }))));
        assert_eq!(sub.next().await.unwrap().unwrap(), Bytes::from_static(b"2"));
    }
}
