//! Producers: best-effort single write per published event.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use eventmill_core::{CodecError, Event};

use crate::log::{LogError, ShardLog};
use crate::queue::{MessageQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<(), ProducerError>;
}

#[async_trait]
impl<P> Producer for Arc<P>
where
    P: Producer + ?Sized,
{
    async fn publish(&self, event: &Event) -> Result<(), ProducerError> {
        (**self).publish(event).await
    }
}

/// `<event name>-<random>`: spreads one event name across shards.
pub fn partition_key(event_name: &str) -> String {
    let n: i64 = rand::thread_rng().gen_range(0..i64::MAX);
    format!("{event_name}-{n}")
}

/// Appends each event to a [`ShardLog`] stream.
pub struct LogProducer {
    log: Arc<dyn ShardLog>,
    stream: String,
}

impl LogProducer {
    pub fn new(log: Arc<dyn ShardLog>, stream: impl Into<String>) -> Self {
        Self {
            log,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl Producer for LogProducer {
    async fn publish(&self, event: &Event) -> Result<(), ProducerError> {
        let data = event.to_wire()?;
        let key = partition_key(event.name());

        let sequence = self.log.put_record(&self.stream, &key, data).await?;
        debug!(producer = "log", stream = %self.stream, partition_key = %key, sequence = %sequence, "put record");
        Ok(())
    }
}

/// Publishes each event to a [`MessageQueue`] topic.
pub struct QueueProducer {
    queue: Arc<dyn MessageQueue>,
}

impl QueueProducer {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Producer for QueueProducer {
    async fn publish(&self, event: &Event) -> Result<(), ProducerError> {
        let body = event.to_wire()?;
        let id = self.queue.publish(body).await?;
        debug!(producer = "queue", queue = self.queue.name(), id = %id, "published");
        Ok(())
    }
}
