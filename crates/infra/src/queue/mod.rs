//! Topic/channel message transport behind the queue-backed consumer.
//!
//! Delivery is at-least-once: a message is handed out, then acknowledged (done)
//! or negatively acknowledged (give it back). What happens to a nacked message
//! is the transport's policy.

mod in_memory;
#[cfg(feature = "redis")]
mod redis_streams;

use std::sync::Arc;

use async_trait::async_trait;

pub use in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempts: u32,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Prepare the subscription (create groups, open connections).
    async fn connect(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Up to `max` deliveries; waits briefly and may return none.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, id: &str) -> Result<(), QueueError>;

    async fn nack(&self, id: &str) -> Result<(), QueueError>;

    /// Enqueue a message on the topic.
    async fn publish(&self, body: Vec<u8>) -> Result<String, QueueError>;
}

#[async_trait]
impl<Q> MessageQueue for Arc<Q>
where
    Q: MessageQueue + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn connect(&self) -> Result<(), QueueError> {
        (**self).connect().await
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        (**self).receive(max).await
    }

    async fn ack(&self, id: &str) -> Result<(), QueueError> {
        (**self).ack(id).await
    }

    async fn nack(&self, id: &str) -> Result<(), QueueError> {
        (**self).nack(id).await
    }

    async fn publish(&self, body: Vec<u8>) -> Result<String, QueueError> {
        (**self).publish(body).await
    }
}
