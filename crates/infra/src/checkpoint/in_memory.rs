//! In-memory checkpoint store for tests and single-process runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use eventmill_core::SequenceNumber;

use super::{CheckpointError, CheckpointKey, CheckpointStore};

#[derive(Debug, Clone)]
struct Stored {
    sequence: SequenceNumber,
    saved_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Stored>,
    saves: usize,
    fail_load: Option<String>,
    fail_save: Option<String>,
}

/// Checkpoints kept in a map; lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: Mutex<Inner>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry without counting it as a save.
    pub fn insert(&self, key: &CheckpointKey, sequence: SequenceNumber) {
        self.inner.lock().unwrap().entries.insert(
            key.as_str().to_string(),
            Stored {
                sequence,
                saved_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, key: &CheckpointKey) -> Option<SequenceNumber> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(key.as_str())
            .map(|s| s.sequence.clone())
    }

    pub fn saved_at(&self, key: &CheckpointKey) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(key.as_str())
            .map(|s| s.saved_at)
    }

    /// Number of successful `save` calls.
    pub fn saves(&self) -> usize {
        self.inner.lock().unwrap().saves
    }

    /// Make the next `load` fail with an unavailable error.
    pub fn fail_next_load(&self, reason: impl Into<String>) {
        self.inner.lock().unwrap().fail_load = Some(reason.into());
    }

    /// Make the next `save` fail with an unavailable error.
    pub fn fail_next_save(&self, reason: impl Into<String>) {
        self.inner.lock().unwrap().fail_save = Some(reason.into());
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn load(&self, key: &CheckpointKey) -> Result<Option<SequenceNumber>, CheckpointError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = inner.fail_load.take() {
            return Err(CheckpointError::Unavailable(reason));
        }
        Ok(inner.entries.get(key.as_str()).map(|s| s.sequence.clone()))
    }

    async fn save(
        &self,
        key: &CheckpointKey,
        sequence: &SequenceNumber,
    ) -> Result<(), CheckpointError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(reason) = inner.fail_save.take() {
            return Err(CheckpointError::Unavailable(reason));
        }
        inner.entries.insert(
            key.as_str().to_string(),
            Stored {
                sequence: sequence.clone(),
                saved_at: Utc::now(),
            },
        );
        inner.saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use eventmill_core::ShardId;

    use super::*;

    #[tokio::test]
    async fn missing_key_loads_as_none() {
        let store = InMemoryCheckpointStore::new();
        let key = CheckpointKey::new("bus", &ShardId::new("s"));
        assert!(store.load(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_write_wins() {
        let store = InMemoryCheckpointStore::new();
        let key = CheckpointKey::new("bus", &ShardId::new("s"));

        store.save(&key, &SequenceNumber::new("10")).await.unwrap();
        store.save(&key, &SequenceNumber::new("7")).await.unwrap();

        assert_eq!(store.load(&key).await.unwrap(), Some(SequenceNumber::new("7")));
        assert_eq!(store.saves(), 2);
        assert!(store.saved_at(&key).is_some());
    }

    #[tokio::test]
    async fn injected_load_failure_fires_once() {
        let store = InMemoryCheckpointStore::new();
        let key = CheckpointKey::new("bus", &ShardId::new("s"));

        store.fail_next_load("connection refused");
        assert!(matches!(
            store.load(&key).await,
            Err(CheckpointError::Unavailable(_))
        ));
        assert!(store.load(&key).await.is_ok());
    }
}
