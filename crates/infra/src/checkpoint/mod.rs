//! Checkpoint persistence for the stream-tailing consumer.
//!
//! A checkpoint is the last processed sequence number of one shard, stored in
//! an external consistent store under `<prefix>/<shard_id>/sequence`.
//!
//! - **Last-write-wins**: stores do no optimistic concurrency; exactly one
//!   consumer per shard is assumed.
//! - **Monotonic**: [`Checkpointer`] never hands a store a sequence lower than
//!   one it already persisted.
//! - **Not found is not an error**: `load` returns `Ok(None)` and the consumer
//!   starts from the trim horizon. Every other load error is fatal to startup.

mod in_memory;
#[cfg(feature = "redis")]
mod redis_store;
mod postgres;

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use eventmill_core::{SequenceNumber, ShardId};

pub use in_memory::InMemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisCheckpointStore;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("checkpoint at {key} is not a sequence number: {value:?}")]
    Corrupt { key: String, value: String },

    #[error("checkpoint store error: {0}")]
    Backend(String),
}

/// Store key of one shard's checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey(String);

impl CheckpointKey {
    /// `<prefix>/<shard_id>/sequence`, with redundant slashes collapsed.
    pub fn new(prefix: &str, shard_id: &ShardId) -> Self {
        let parts = [prefix, shard_id.as_str(), "sequence"];
        let joined = parts
            .iter()
            .flat_map(|part| part.split('/'))
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        let rooted = if prefix.starts_with('/') {
            format!("/{joined}")
        } else {
            joined
        };
        Self(rooted)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable per-shard checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Read the checkpoint; `Ok(None)` when no entry exists.
    async fn load(&self, key: &CheckpointKey) -> Result<Option<SequenceNumber>, CheckpointError>;

    /// Overwrite the checkpoint.
    async fn save(&self, key: &CheckpointKey, sequence: &SequenceNumber)
    -> Result<(), CheckpointError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn load(&self, key: &CheckpointKey) -> Result<Option<SequenceNumber>, CheckpointError> {
        (**self).load(key).await
    }

    async fn save(
        &self,
        key: &CheckpointKey,
        sequence: &SequenceNumber,
    ) -> Result<(), CheckpointError> {
        (**self).save(key, sequence).await
    }
}

#[derive(Debug, Default)]
struct Position {
    last_seen: Option<SequenceNumber>,
    last_persisted: Option<SequenceNumber>,
}

/// The consumer's read position, shared by the fetch loop and the flusher.
///
/// The fetch loop is the only writer ([`advance`](Self::advance)); flushes
/// persist a snapshot. Both sides are monotonic: a lower sequence is ignored
/// on advance and never written on flush. Flushes are serialized so two
/// concurrent flushes cannot reorder their writes.
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    key: CheckpointKey,
    position: Mutex<Position>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn CheckpointStore>, key: CheckpointKey) -> Self {
        Self {
            store,
            key,
            position: Mutex::new(Position::default()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn key(&self) -> &CheckpointKey {
        &self.key
    }

    /// Load the persisted checkpoint and seed the position with it.
    pub async fn restore(&self) -> Result<Option<SequenceNumber>, CheckpointError> {
        let loaded = self.store.load(&self.key).await?;
        if let Some(seq) = &loaded {
            let mut pos = self.position.lock().unwrap();
            pos.last_seen = Some(seq.clone());
            pos.last_persisted = Some(seq.clone());
        }
        Ok(loaded)
    }

    /// Record `sequence` as processed. Returns `false` if it would move backward.
    pub fn advance(&self, sequence: SequenceNumber) -> bool {
        let mut pos = self.position.lock().unwrap();
        match &pos.last_seen {
            Some(current) if *current >= sequence => false,
            _ => {
                pos.last_seen = Some(sequence);
                true
            }
        }
    }

    pub fn last_seen(&self) -> Option<SequenceNumber> {
        self.position.lock().unwrap().last_seen.clone()
    }

    pub fn last_persisted(&self) -> Option<SequenceNumber> {
        self.position.lock().unwrap().last_persisted.clone()
    }

    /// Persist the last-seen sequence if it is ahead of the stored one.
    ///
    /// Returns the sequence written, or `None` when there was nothing new.
    pub async fn flush(&self) -> Result<Option<SequenceNumber>, CheckpointError> {
        let _serialized = self.flush_lock.lock().await;

        let pending = {
            let pos = self.position.lock().unwrap();
            match (&pos.last_seen, &pos.last_persisted) {
                (Some(seen), Some(persisted)) if seen <= persisted => None,
                (Some(seen), _) => Some(seen.clone()),
                (None, _) => None,
            }
        };

        let Some(sequence) = pending else {
            return Ok(None);
        };

        self.store.save(&self.key, &sequence).await?;
        debug!(key = %self.key, sequence = %sequence, store = self.store.name(), "checkpoint saved");

        let mut pos = self.position.lock().unwrap();
        if pos.last_persisted.as_ref().is_none_or(|p| *p < sequence) {
            pos.last_persisted = Some(sequence.clone());
        }
        Ok(Some(sequence))
    }
}
