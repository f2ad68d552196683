//! Redis Streams consumer-group queue.
//!
//! - **Topic**: a stream key; publishing is `XADD <topic> * body <bytes>`.
//! - **Channel**: a consumer group on that stream; each message goes to one
//!   consumer of the group.
//! - **Ack**: `XACK`. **Nack**: nothing; the entry stays in the group's pending
//!   list and is reclaimed with `XCLAIM` once it has been idle long enough.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{Delivery, MessageQueue, QueueError};

/// Pending entries idle longer than this are redelivered.
const DEFAULT_RECLAIM_IDLE_MS: u64 = 30_000;

/// How long `XREADGROUP` blocks waiting for new entries.
const DEFAULT_BLOCK_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    topic: String,
    channel: String,
    consumer_name: String,
    reclaim_idle_ms: u64,
    block_ms: u64,
}

impl RedisStreamsQueue {
    pub fn new(
        redis_url: impl AsRef<str>,
        topic: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let channel = channel.into();
        Ok(Self {
            client: Arc::new(client),
            topic: topic.into(),
            consumer_name: format!("{}-{}", channel, Uuid::now_v7()),
            channel,
            reclaim_idle_ms: DEFAULT_RECLAIM_IDLE_MS,
            block_ms: DEFAULT_BLOCK_MS,
        })
    }

    pub fn with_reclaim_idle_ms(mut self, ms: u64) -> Self {
        self.reclaim_idle_ms = ms;
        self
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&Self, &mut redis::Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = this
                .client
                .get_connection()
                .map_err(|e| QueueError::Connection(e.to_string()))?;
            f(&this, &mut conn)
        })
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))?
    }

    /// Claim entries of the group that have been pending too long.
    fn reclaim_sync(
        &self,
        conn: &mut redis::Connection,
        max: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        // Extended XPENDING form: [id, consumer, idle_ms, deliveries]
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.topic)
            .arg(&self.channel)
            .arg("IDLE")
            .arg(self.reclaim_idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XPENDING failed: {e}")))?;

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let attempts: HashMap<String, u32> = pending
            .iter()
            .map(|(id, _, _, count)| (id.clone(), *count as u32 + 1))
            .collect();
        let ids: Vec<String> = pending.iter().map(|(id, _, _, _)| id.clone()).collect();

        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(&self.topic)
            .arg(&self.channel)
            .arg(&self.consumer_name)
            .arg(self.reclaim_idle_ms)
            .arg(&ids[..])
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XCLAIM failed: {e}")))?;

        Ok(claimed
            .iter()
            .filter_map(|entry| parse_entry(entry).ok())
            .map(|mut d| {
                d.attempts = attempts.get(&d.id).copied().unwrap_or(2);
                d
            })
            .collect())
    }

    fn read_new_sync(
        &self,
        conn: &mut redis::Connection,
        max: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        // Nil reply when BLOCK times out with nothing new.
        let reply: Option<HashMap<String, Vec<redis::Value>>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.channel)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(self.block_ms)
            .arg("STREAMS")
            .arg(&self.topic)
            .arg(">")
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        let entries = reply
            .and_then(|mut streams| streams.remove(&self.topic))
            .unwrap_or_default();

        Ok(entries.iter().filter_map(|entry| parse_entry(entry).ok()).collect())
    }
}

fn bytes(value: &redis::Value) -> Option<Vec<u8>> {
    match value {
        redis::Value::Data(data) => Some(data.clone()),
        redis::Value::Status(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Parse `[id, [field, value, ...]]` into a first-attempt delivery.
fn parse_entry(entry: &redis::Value) -> Result<Delivery, QueueError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(QueueError::Command("invalid entry format".to_string()));
    };
    let (Some(id), Some(redis::Value::Bulk(fields))) = (parts.first().and_then(bytes), parts.get(1))
    else {
        return Err(QueueError::Command("invalid entry layout".to_string()));
    };

    let body = fields
        .chunks(2)
        .find_map(|pair| match pair {
            [k, v] if bytes(k).as_deref() == Some(b"body".as_slice()) => bytes(v),
            _ => None,
        })
        .unwrap_or_default();

    Ok(Delivery {
        id: String::from_utf8_lossy(&id).to_string(),
        body,
        attempts: 1,
    })
}

#[async_trait]
impl MessageQueue for RedisStreamsQueue {
    fn name(&self) -> &str {
        "redis-streams"
    }

    async fn connect(&self) -> Result<(), QueueError> {
        self.blocking(|this, conn| {
            // BUSYGROUP (group exists) is fine.
            let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&this.topic)
                .arg(&this.channel)
                .arg("0")
                .arg("MKSTREAM")
                .query(conn);
            match created {
                Ok(_) => Ok(()),
                Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                Err(e) => Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
            }
        })
        .await
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        self.blocking(move |this, conn| {
            let reclaimed = this.reclaim_sync(conn, max)?;
            if !reclaimed.is_empty() {
                return Ok(reclaimed);
            }
            this.read_new_sync(conn, max)
        })
        .await
    }

    async fn ack(&self, id: &str) -> Result<(), QueueError> {
        let id = id.to_string();
        self.blocking(move |this, conn| {
            let _: u64 = redis::cmd("XACK")
                .arg(&this.topic)
                .arg(&this.channel)
                .arg(&id)
                .query(conn)
                .map_err(|e| QueueError::Command(format!("XACK failed: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn nack(&self, id: &str) -> Result<(), QueueError> {
        debug!(queue = "redis-streams", id, "left pending for redelivery");
        Ok(())
    }

    async fn publish(&self, body: Vec<u8>) -> Result<String, QueueError> {
        self.blocking(move |this, conn| {
            redis::cmd("XADD")
                .arg(&this.topic)
                .arg("*")
                .arg("body")
                .arg(body)
                .query(conn)
                .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))
        })
        .await
    }
}
