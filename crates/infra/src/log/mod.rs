//! Partitioned append-only log the stream consumer tails.
//!
//! The log is addressed by stream name; a stream has one or more shards, each an
//! ordered sequence of records. Reading goes through opaque, server-issued
//! iterators that are consumed and replaced on every fetch:
//!
//! ```text
//! shard_iterator(AfterSequence(n) | TrimHorizon) ─► it₀
//! get_records(it₀) ─► { records, next_iterator: it₁, millis_behind_latest }
//! get_records(it₁) ─► ...
//! ```
//!
//! A `None` next iterator means the shard is closed and will never yield more.

mod in_memory;
#[cfg(feature = "redis")]
mod redis_streams;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use eventmill_core::{SequenceNumber, ShardId};

pub use in_memory::InMemoryLog;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsLog;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("shard iterator expired")]
    IteratorExpired,

    #[error("throughput exceeded: {0}")]
    Throttled(String),

    #[error("log transport error: {0}")]
    Transport(String),
}

impl LogError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LogError::IteratorExpired | LogError::Throttled(_) | LogError::Transport(_)
        )
    }
}

/// Where a new iterator starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorStart {
    /// Oldest retained record.
    TrimHorizon,
    /// Immediately after the given sequence number.
    AfterSequence(SequenceNumber),
}

/// Opaque read cursor issued by the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardIterator(String);

impl ShardIterator {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub sequence: SequenceNumber,
    pub partition_key: String,
    pub data: Vec<u8>,
}

/// Result of a single fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    /// `None` once the shard is closed.
    pub next_iterator: Option<ShardIterator>,
    /// How far behind the tip the reader is; zero means caught up.
    pub millis_behind_latest: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescription {
    pub name: String,
    pub shards: Vec<ShardId>,
}

/// Log backend.
#[async_trait]
pub trait ShardLog: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn describe_stream(&self, stream: &str) -> Result<StreamDescription, LogError>;

    async fn shard_iterator(
        &self,
        stream: &str,
        shard: &ShardId,
        start: IteratorStart,
    ) -> Result<ShardIterator, LogError>;

    async fn get_records(
        &self,
        iterator: &ShardIterator,
        limit: usize,
    ) -> Result<RecordBatch, LogError>;

    /// Append one record; returns its sequence number.
    async fn put_record(
        &self,
        stream: &str,
        partition_key: &str,
        data: Vec<u8>,
    ) -> Result<SequenceNumber, LogError>;
}

#[async_trait]
impl<L> ShardLog for Arc<L>
where
    L: ShardLog + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn describe_stream(&self, stream: &str) -> Result<StreamDescription, LogError> {
        (**self).describe_stream(stream).await
    }

    async fn shard_iterator(
        &self,
        stream: &str,
        shard: &ShardId,
        start: IteratorStart,
    ) -> Result<ShardIterator, LogError> {
        (**self).shard_iterator(stream, shard, start).await
    }

    async fn get_records(
        &self,
        iterator: &ShardIterator,
        limit: usize,
    ) -> Result<RecordBatch, LogError> {
        (**self).get_records(iterator, limit).await
    }

    async fn put_record(
        &self,
        stream: &str,
        partition_key: &str,
        data: Vec<u8>,
    ) -> Result<SequenceNumber, LogError> {
        (**self).put_record(stream, partition_key, data).await
    }
}
