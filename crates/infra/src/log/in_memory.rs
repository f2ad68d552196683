//! In-memory shard log with failure injection.
//!
//! Iterator tokens encode `(epoch, shard, offset, stream)`. Bumping the epoch
//! with [`InMemoryLog::expire_iterators`] invalidates every outstanding token,
//! the way a real log expires idle iterators.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;

use eventmill_core::{SequenceNumber, ShardId};

use super::{
    IteratorStart, LogError, Record, RecordBatch, ShardIterator, ShardLog, StreamDescription,
};

const MILLIS_PER_PENDING_RECORD: u64 = 1_000;

#[derive(Debug)]
struct Shard {
    id: ShardId,
    records: Vec<Record>,
    closed: bool,
}

#[derive(Debug)]
struct Stream {
    shards: Vec<Shard>,
    next_sequence: u64,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, Stream>,
    epoch: u64,
    failures: VecDeque<LogError>,
    fetches: usize,
}

/// Shard log held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    inner: Mutex<Inner>,
}

struct Cursor {
    epoch: u64,
    shard: usize,
    offset: usize,
    stream: String,
}

impl Cursor {
    fn encode(&self) -> ShardIterator {
        ShardIterator::new(format!(
            "{}:{}:{}:{}",
            self.epoch, self.shard, self.offset, self.stream
        ))
    }

    fn decode(iterator: &ShardIterator) -> Result<Self, LogError> {
        let mut parts = iterator.as_str().splitn(4, ':');
        let mut number = || {
            parts
                .next()
                .and_then(|p| p.parse::<u64>().ok())
                .ok_or_else(|| LogError::Transport(format!("malformed iterator: {iterator}")))
        };
        let epoch = number()?;
        let shard = number()? as usize;
        let offset = number()? as usize;
        let stream = parts
            .next()
            .ok_or_else(|| LogError::Transport(format!("malformed iterator: {iterator}")))?
            .to_string();
        Ok(Self {
            epoch,
            shard,
            offset,
            stream,
        })
    }
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a stream with `shard_count` open shards.
    pub fn create_stream(&self, name: &str, shard_count: usize) {
        let shards = (0..shard_count.max(1))
            .map(|i| Shard {
                id: ShardId::new(format!("shardId-{i:012}")),
                records: Vec::new(),
                closed: false,
            })
            .collect();
        self.inner.lock().unwrap().streams.insert(
            name.to_string(),
            Stream {
                shards,
                next_sequence: 1,
            },
        );
    }

    /// Append raw bytes to one shard, bypassing partitioning.
    pub fn append(&self, stream: &str, shard: usize, data: Vec<u8>) -> Result<SequenceNumber, LogError> {
        let mut inner = self.inner.lock().unwrap();
        let s = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;
        append_to(s, shard, String::new(), data)
    }

    /// Mark a shard closed: readers get `next_iterator: None` once drained.
    pub fn close_shard(&self, stream: &str, shard: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.streams.get_mut(stream).and_then(|s| s.shards.get_mut(shard)) {
            s.closed = true;
        }
    }

    /// Queue an error for the next `get_records` call.
    pub fn fail_next(&self, error: LogError) {
        self.inner.lock().unwrap().failures.push_back(error);
    }

    /// Invalidate every iterator handed out so far.
    pub fn expire_iterators(&self) {
        self.inner.lock().unwrap().epoch += 1;
    }

    /// Number of `get_records` calls, failed ones included.
    pub fn fetches(&self) -> usize {
        self.inner.lock().unwrap().fetches
    }

    pub fn records(&self, stream: &str, shard: usize) -> Vec<Record> {
        self.inner
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .and_then(|s| s.shards.get(shard))
            .map(|s| s.records.clone())
            .unwrap_or_default()
    }
}

fn append_to(
    stream: &mut Stream,
    shard: usize,
    partition_key: String,
    data: Vec<u8>,
) -> Result<SequenceNumber, LogError> {
    let sequence = SequenceNumber::new(format!("{:020}", stream.next_sequence));
    let target = stream
        .shards
        .get_mut(shard)
        .ok_or_else(|| LogError::ShardNotFound(shard.to_string()))?;
    if target.closed {
        return Err(LogError::Transport(format!("shard {} is closed", target.id)));
    }
    stream.next_sequence += 1;
    target.records.push(Record {
        sequence: sequence.clone(),
        partition_key,
        data,
    });
    Ok(sequence)
}

#[async_trait]
impl ShardLog for InMemoryLog {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn describe_stream(&self, stream: &str) -> Result<StreamDescription, LogError> {
        let inner = self.inner.lock().unwrap();
        let s = inner
            .streams
            .get(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;
        Ok(StreamDescription {
            name: stream.to_string(),
            shards: s.shards.iter().map(|sh| sh.id.clone()).collect(),
        })
    }

    async fn shard_iterator(
        &self,
        stream: &str,
        shard: &ShardId,
        start: IteratorStart,
    ) -> Result<ShardIterator, LogError> {
        let inner = self.inner.lock().unwrap();
        let s = inner
            .streams
            .get(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;
        let (index, sh) = s
            .shards
            .iter()
            .enumerate()
            .find(|(_, sh)| sh.id == *shard)
            .ok_or_else(|| LogError::ShardNotFound(shard.to_string()))?;

        let offset = match start {
            IteratorStart::TrimHorizon => 0,
            IteratorStart::AfterSequence(seq) => sh.records.partition_point(|r| r.sequence <= seq),
        };

        Ok(Cursor {
            epoch: inner.epoch,
            shard: index,
            offset,
            stream: stream.to_string(),
        }
        .encode())
    }

    async fn get_records(
        &self,
        iterator: &ShardIterator,
        limit: usize,
    ) -> Result<RecordBatch, LogError> {
        let mut inner = self.inner.lock().unwrap();
        inner.fetches += 1;

        if let Some(err) = inner.failures.pop_front() {
            return Err(err);
        }

        let cursor = Cursor::decode(iterator)?;
        if cursor.epoch != inner.epoch {
            return Err(LogError::IteratorExpired);
        }

        let shard = inner
            .streams
            .get(&cursor.stream)
            .ok_or_else(|| LogError::StreamNotFound(cursor.stream.clone()))?
            .shards
            .get(cursor.shard)
            .ok_or_else(|| LogError::ShardNotFound(cursor.shard.to_string()))?;

        let start = cursor.offset.min(shard.records.len());
        let end = (start + limit.max(1)).min(shard.records.len());
        let records = shard.records[start..end].to_vec();
        let pending = (shard.records.len() - end) as u64;

        let next_iterator = if shard.closed && end == shard.records.len() {
            None
        } else {
            Some(
                Cursor {
                    offset: end,
                    ..cursor
                }
                .encode(),
            )
        };

        Ok(RecordBatch {
            records,
            next_iterator,
            millis_behind_latest: pending * MILLIS_PER_PENDING_RECORD,
        })
    }

    async fn put_record(
        &self,
        stream: &str,
        partition_key: &str,
        data: Vec<u8>,
    ) -> Result<SequenceNumber, LogError> {
        let mut inner = self.inner.lock().unwrap();
        let s = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| LogError::StreamNotFound(stream.to_string()))?;

        let open: Vec<usize> = s
            .shards
            .iter()
            .enumerate()
            .filter(|(_, sh)| !sh.closed)
            .map(|(i, _)| i)
            .collect();
        if open.is_empty() {
            return Err(LogError::Transport(format!("stream {stream} has no open shard")));
        }

        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        let shard = open[(hasher.finish() % open.len() as u64) as usize];

        append_to(s, shard, partition_key.to_string(), data)
    }
}
