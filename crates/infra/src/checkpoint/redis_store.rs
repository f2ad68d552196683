//! Redis-backed checkpoint store (`GET`/`SET`, no expiry).

use std::sync::Arc;

use async_trait::async_trait;

use eventmill_core::SequenceNumber;

use super::{CheckpointError, CheckpointKey, CheckpointStore};

/// Checkpoints stored as plain string values under their key.
#[derive(Debug, Clone)]
pub struct RedisCheckpointStore {
    client: Arc<redis::Client>,
}

impl RedisCheckpointStore {
    /// `redis_url` e.g. `"redis://localhost:6379"`.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CheckpointError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn get_sync(
        client: &redis::Client,
        key: &str,
    ) -> Result<Option<String>, CheckpointError> {
        let mut conn = client
            .get_connection()
            .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;

        redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| CheckpointError::Backend(format!("GET failed: {}", e)))
    }

    fn set_sync(client: &redis::Client, key: &str, value: &str) -> Result<(), CheckpointError> {
        let mut conn = client
            .get_connection()
            .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;

        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query(&mut conn)
            .map_err(|e| CheckpointError::Backend(format!("SET failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn load(&self, key: &CheckpointKey) -> Result<Option<SequenceNumber>, CheckpointError> {
        let client = self.client.clone();
        let k = key.as_str().to_string();

        let raw = tokio::task::spawn_blocking(move || Self::get_sync(&client, &k))
            .await
            .map_err(|e| CheckpointError::Backend(e.to_string()))??;

        match raw {
            None => Ok(None),
            Some(value) if value.trim().is_empty() => Err(CheckpointError::Corrupt {
                key: key.to_string(),
                value,
            }),
            Some(value) => Ok(Some(SequenceNumber::new(value))),
        }
    }

    async fn save(
        &self,
        key: &CheckpointKey,
        sequence: &SequenceNumber,
    ) -> Result<(), CheckpointError> {
        let client = self.client.clone();
        let k = key.as_str().to_string();
        let v = sequence.as_str().to_string();

        tokio::task::spawn_blocking(move || Self::set_sync(&client, &k, &v))
            .await
            .map_err(|e| CheckpointError::Backend(e.to_string()))?
    }
}
