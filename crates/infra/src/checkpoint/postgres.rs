//! Postgres-backed checkpoint store.
//!
//! One row per key in `eventmill_checkpoints`, written with an upsert.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};

use eventmill_core::SequenceNumber;

use super::{CheckpointError, CheckpointKey, CheckpointStore};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS eventmill_checkpoints (
        checkpoint_key TEXT PRIMARY KEY,
        sequence_number TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

/// Checkpoints persisted in Postgres.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect lazily; the first query opens the connection.
    pub fn connect_lazy(database_url: &str) -> Result<Self, CheckpointError> {
        let pool = PgPool::connect_lazy(database_url)
            .map_err(|e| CheckpointError::Unavailable(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Create the checkpoint table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), CheckpointError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

fn map_sqlx(e: sqlx::Error) -> CheckpointError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            CheckpointError::Unavailable(e.to_string())
        }
        other => CheckpointError::Backend(other.to_string()),
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn load(&self, key: &CheckpointKey) -> Result<Option<SequenceNumber>, CheckpointError> {
        let row = sqlx::query(
            r#"
            SELECT sequence_number
            FROM eventmill_checkpoints
            WHERE checkpoint_key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let value: String = row
            .try_get("sequence_number")
            .map_err(|e| CheckpointError::Backend(e.to_string()))?;

        if value.trim().is_empty() {
            return Err(CheckpointError::Corrupt {
                key: key.to_string(),
                value,
            });
        }
        Ok(Some(SequenceNumber::new(value)))
    }

    async fn save(
        &self,
        key: &CheckpointKey,
        sequence: &SequenceNumber,
    ) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            INSERT INTO eventmill_checkpoints (checkpoint_key, sequence_number, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (checkpoint_key)
            DO UPDATE SET
                sequence_number = EXCLUDED.sequence_number,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key.as_str())
        .bind(sequence.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }
}
