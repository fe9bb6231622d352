//! Postgres mirror of the bucket states.

use secrecy::ExposeSecret;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};

use super::{DurableMirror, MirrorError};
use crate::bucket::{BucketConfig, BucketSnapshot, BucketState};
use config::MirrorConfig;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rate_limit_buckets (
    bucket_key TEXT PRIMARY KEY,
    capacity BIGINT NOT NULL,
    refill_rate DOUBLE PRECISION NOT NULL,
    tokens DOUBLE PRECISION NOT NULL,
    last_refill TIMESTAMPTZ NOT NULL
)
"#;

const UPSERT: &str = r#"
INSERT INTO rate_limit_buckets (bucket_key, capacity, refill_rate, tokens, last_refill)
VALUES ($1, $2, $3, $4, to_timestamp($5))
ON CONFLICT (bucket_key) DO UPDATE SET
    capacity = EXCLUDED.capacity,
    refill_rate = EXCLUDED.refill_rate,
    tokens = EXCLUDED.tokens,
    last_refill = EXCLUDED.last_refill
"#;

const LOAD_ALL: &str = r#"
SELECT bucket_key, capacity, refill_rate, tokens, EXTRACT(EPOCH FROM last_refill)::float8 AS last_refill
FROM rate_limit_buckets
"#;

/// Bucket snapshots in the `rate_limit_buckets` table.
#[derive(Debug, Clone)]
pub struct PostgresMirror {
    pool: PgPool,
}

impl PostgresMirror {
    /// Connects the pool and creates the table when configured to.
    pub async fn connect(config: &MirrorConfig) -> Result<Self, MirrorError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(config.url.expose_secret())
            .await
            .map_err(|e| MirrorError::Connection(e.to_string()))?;

        let mirror = Self::from_pool(pool);

        if config.create_table {
            mirror.ensure_table().await?;
        }

        Ok(mirror)
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `rate_limit_buckets` table if it does not exist.
    pub async fn ensure_table(&self) -> Result<(), MirrorError> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| MirrorError::Query(e.to_string()))?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl DurableMirror for PostgresMirror {
    async fn upsert(&self, snapshot: &BucketSnapshot) -> Result<(), MirrorError> {
        sqlx::query(UPSERT)
            .bind(&snapshot.key)
            .bind(snapshot.config.capacity)
            .bind(snapshot.config.refill_rate)
            .bind(snapshot.state.tokens)
            .bind(snapshot.state.last_refill)
            .execute(&self.pool)
            .await
            .map_err(|e| MirrorError::Query(e.to_string()))?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<BucketSnapshot>, MirrorError> {
        let rows = sqlx::query(LOAD_ALL)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MirrorError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| -> Result<BucketSnapshot, sqlx::Error> {
                Ok(BucketSnapshot {
                    key: row.try_get("bucket_key")?,
                    config: BucketConfig::new(row.try_get("capacity")?, row.try_get("refill_rate")?),
                    state: BucketState {
                        tokens: row.try_get("tokens")?,
                        last_refill: row.try_get("last_refill")?,
                    },
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MirrorError::Query(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs against a live Postgres when `DATABASE_URL` is set.
    #[tokio::test]
    async fn upsert_then_load_round_trips_through_the_table() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };

        let pool = PgPoolOptions::new().max_connections(1).connect(&url).await.unwrap();
        let mirror = PostgresMirror::from_pool(pool);
        mirror.ensure_table().await.unwrap();

        let key = format!("test:{}", std::process::id());

        let mut snapshot = BucketSnapshot {
            key: key.clone(),
            config: BucketConfig::new(30, 0.5),
            state: BucketState {
                tokens: 12.5,
                last_refill: 1_700_000_000.25,
            },
        };

        mirror.upsert(&snapshot).await.unwrap();

        snapshot.state.tokens = 3.0;
        mirror.upsert(&snapshot).await.unwrap();

        let loaded = mirror.load_all().await.unwrap();
        let row = loaded.into_iter().find(|s| s.key == key).unwrap();

        assert_eq!(row.config, snapshot.config);
        assert_eq!(row.state.tokens, 3.0);
        assert!((row.state.last_refill - 1_700_000_000.25).abs() < 1e-3);
    }
}
