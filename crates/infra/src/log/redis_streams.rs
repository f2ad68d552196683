//! Redis Streams-backed shard log.
//!
//! Each log stream maps to one Redis stream key and therefore has exactly one
//! shard. Entry IDs (`<ms>-<seq>`) are the sequence numbers; an iterator is
//! simply the last ID read, and fetching uses an exclusive `XRANGE`.
//!
//! Fields per entry: `partition_key`, `data`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use eventmill_core::{SequenceNumber, ShardId};

use super::{
    IteratorStart, LogError, Record, RecordBatch, ShardIterator, ShardLog, StreamDescription,
};

/// The single shard every Redis-backed stream exposes.
pub const SHARD_ID: &str = "shardId-000000000000";

const ITERATOR_SEPARATOR: char = '|';

#[derive(Debug, Clone)]
pub struct RedisStreamsLog {
    client: Arc<redis::Client>,
    key_prefix: String,
}

impl RedisStreamsLog {
    /// `redis_url` e.g. `"redis://localhost:6379"`; stream keys are `<key_prefix><stream>`.
    pub fn new(redis_url: impl AsRef<str>, key_prefix: impl Into<String>) -> Result<Self, LogError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LogError::Transport(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, stream: &str) -> String {
        format!("{}{}", self.key_prefix, stream)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, LogError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> Result<T, LogError> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection()
                .map_err(|e| LogError::Transport(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| LogError::Transport(e.to_string()))?
    }
}

fn command_error(cmd: &str, e: redis::RedisError) -> LogError {
    LogError::Transport(format!("{cmd} failed: {e}"))
}

fn decode_iterator(iterator: &ShardIterator) -> Result<(String, String), LogError> {
    iterator
        .as_str()
        .split_once(ITERATOR_SEPARATOR)
        .map(|(key, id)| (key.to_string(), id.to_string()))
        .ok_or_else(|| LogError::Transport(format!("malformed iterator: {iterator}")))
}

/// A stream key only appears with its first `XADD`; until then the stream is
/// empty, not missing. A key holding any other type is not a stream.
fn describe_key(stream: &str, key_type: &str) -> Result<StreamDescription, LogError> {
    match key_type {
        "stream" | "none" => Ok(StreamDescription {
            name: stream.to_string(),
            shards: vec![ShardId::new(SHARD_ID)],
        }),
        _ => Err(LogError::StreamNotFound(stream.to_string())),
    }
}

/// Milliseconds component of a stream entry ID.
fn id_millis(id: &str) -> u64 {
    id.split('-').next().and_then(|ms| ms.parse().ok()).unwrap_or(0)
}

fn bulk_string(value: &redis::Value) -> Option<Vec<u8>> {
    match value {
        redis::Value::Data(data) => Some(data.clone()),
        redis::Value::Status(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Parse one `[id, [field, value, ...]]` entry.
fn parse_entry(entry: &redis::Value) -> Result<Record, LogError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(LogError::Transport("invalid entry format".to_string()));
    };
    if parts.len() < 2 {
        return Err(LogError::Transport("entry too short".to_string()));
    }

    let id = bulk_string(&parts[0])
        .map(|raw| String::from_utf8_lossy(&raw).to_string())
        .ok_or_else(|| LogError::Transport("invalid entry id".to_string()))?;

    let redis::Value::Bulk(field_values) = &parts[1] else {
        return Err(LogError::Transport("invalid entry fields".to_string()));
    };

    let mut fields: HashMap<String, Vec<u8>> = HashMap::new();
    for chunk in field_values.chunks(2) {
        if let [k, v] = chunk {
            if let (Some(k), Some(v)) = (bulk_string(k), bulk_string(v)) {
                fields.insert(String::from_utf8_lossy(&k).to_string(), v);
            }
        }
    }

    let partition_key = fields
        .remove("partition_key")
        .map(|raw| String::from_utf8_lossy(&raw).to_string())
        .unwrap_or_default();
    let data = fields.remove("data").unwrap_or_default();

    Ok(Record {
        sequence: SequenceNumber::new(id),
        partition_key,
        data,
    })
}

#[async_trait]
impl ShardLog for RedisStreamsLog {
    fn name(&self) -> &str {
        "redis-streams"
    }

    async fn describe_stream(&self, stream: &str) -> Result<StreamDescription, LogError> {
        let key = self.key(stream);
        let key_type: String = self
            .blocking(move |conn| {
                redis::cmd("TYPE")
                    .arg(&key)
                    .query(conn)
                    .map_err(|e| command_error("TYPE", e))
            })
            .await?;

        describe_key(stream, &key_type)
    }

    async fn shard_iterator(
        &self,
        stream: &str,
        shard: &ShardId,
        start: IteratorStart,
    ) -> Result<ShardIterator, LogError> {
        if shard.as_str() != SHARD_ID {
            return Err(LogError::ShardNotFound(shard.to_string()));
        }
        let after = match start {
            IteratorStart::TrimHorizon => "0-0".to_string(),
            IteratorStart::AfterSequence(seq) => seq.into_inner(),
        };
        Ok(ShardIterator::new(format!(
            "{}{}{}",
            self.key(stream),
            ITERATOR_SEPARATOR,
            after
        )))
    }

    async fn get_records(
        &self,
        iterator: &ShardIterator,
        limit: usize,
    ) -> Result<RecordBatch, LogError> {
        let (key, after) = decode_iterator(iterator)?;
        let count = limit.max(1);

        let (entries, tip) = {
            let key = key.clone();
            let after = after.clone();
            self.blocking(move |conn| {
                // XRANGE with "(" is exclusive of the given ID.
                let entries: Vec<redis::Value> = redis::cmd("XRANGE")
                    .arg(&key)
                    .arg(format!("({after}"))
                    .arg("+")
                    .arg("COUNT")
                    .arg(count)
                    .query(conn)
                    .map_err(|e| command_error("XRANGE", e))?;

                let last: Vec<redis::Value> = redis::cmd("XREVRANGE")
                    .arg(&key)
                    .arg("+")
                    .arg("-")
                    .arg("COUNT")
                    .arg(1)
                    .query(conn)
                    .map_err(|e| command_error("XREVRANGE", e))?;

                Ok((entries, last))
            })
            .await?
        };

        let records = entries
            .iter()
            .map(parse_entry)
            .collect::<Result<Vec<_>, _>>()?;

        let position = records
            .last()
            .map(|r| r.sequence.as_str().to_string())
            .unwrap_or(after);

        let tip_id = tip
            .first()
            .and_then(|entry| parse_entry(entry).ok())
            .map(|r| r.sequence.into_inner());

        let millis_behind_latest = match tip_id {
            Some(tip) if tip != position => id_millis(&tip).saturating_sub(id_millis(&position)).max(1),
            _ => 0,
        };

        Ok(RecordBatch {
            records,
            next_iterator: Some(ShardIterator::new(format!(
                "{key}{ITERATOR_SEPARATOR}{position}"
            ))),
            millis_behind_latest,
        })
    }

    async fn put_record(
        &self,
        stream: &str,
        partition_key: &str,
        data: Vec<u8>,
    ) -> Result<SequenceNumber, LogError> {
        let key = self.key(stream);
        let partition_key = partition_key.to_string();

        let id: String = self
            .blocking(move |conn| {
                redis::cmd("XADD")
                    .arg(&key)
                    .arg("*")
                    .arg("partition_key")
                    .arg(&partition_key)
                    .arg("data")
                    .arg(data)
                    .query(conn)
                    .map_err(|e| command_error("XADD", e))
            })
            .await?;

        Ok(SequenceNumber::new(id))
    }
}
