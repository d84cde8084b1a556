use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, Connection, Pool, Postgres, Row};
use std::env;
use std::time::Duration;

use crate::error::StoreError;
use crate::events::ChainEvent;
use crate::extractor::ExtractorKind;
use crate::settings::DatabaseSettings;
use crate::stats::Stat;
use crate::store::{sort_events, validate_batch, EventStore, StatStore};

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

/// Database schema name
pub const SCHEMA: &str = "token_flow";

pub async fn connect(settings: &DatabaseSettings) -> Result<DbPool> {
    // Force UTF-8 client encoding FIRST to avoid Windows sqlx bug with non-ASCII error messages
    env::set_var("PGCLIENTENCODING", "UTF8");

    let database_url = settings
        .url
        .clone()
        .or_else(|| env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;

    // Retries with exponential backoff to survive DNS/startup races in Compose
    let mut last_err: Option<anyhow::Error> = None;
    let max_attempts: u32 = 10;
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&database_url)
            .await
        {
            Ok(pool) => {
                log::info!(
                    "Connected to database (attempt {}/{}).",
                    attempt,
                    max_attempts
                );
                if let Err(e) = initialize_database(&pool).await {
                    last_err = Some(e);
                } else {
                    return Ok(pool);
                }
            }
            Err(e) => {
                last_err = Some(e.into());
            }
        }
        let delay_ms = (1u64 << attempt.min(6)) * 200; // 400ms, 800ms, ... capped at ~12.8s
        log::warn!(
            "DB connect/init attempt {}/{} failed. Retrying in {} ms...",
            attempt,
            max_attempts,
            delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Unknown DB connection error")))
}

pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    const MIGRATION_LOCK_ID: i64 = 0x544F4B464C4F57; // "TOKFLOW" in hex

    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.chain_events (
            chain_id BIGINT NOT NULL,
            id TEXT NOT NULL,
            block_number BIGINT NOT NULL,
            log_index BIGINT NOT NULL,
            kind VARCHAR(16) NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (chain_id, id)
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_chain_events_order ON {}.chain_events (chain_id, block_number, log_index)",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.chain_stats (
            chain_id BIGINT PRIMARY KEY,
            version TEXT NOT NULL,
            last_extracted_at TIMESTAMPTZ NOT NULL,
            success BOOLEAN NOT NULL,
            source VARCHAR(16),
            last_block BIGINT NOT NULL DEFAULT 0
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    tx.commit().await?;
    log::info!("Database schema {} ready.", SCHEMA);
    Ok(())
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Connection-level failures make the store unavailable; everything else rejects the batch.
fn insert_error(chain_id: u64, total: usize, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
        other => StoreError::Insert {
            chain_id,
            total,
            reason: other.to_string(),
        },
    }
}

/// Event and stat store over PostgreSQL. Events are stored as JSON text next to their sort keys.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn count_by_chain(&self, chain_id: u64) -> Result<usize, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS count FROM {}.chain_events WHERE chain_id = $1",
            SCHEMA
        ))
        .bind(chain_id as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        let count: i64 = row.try_get("count").map_err(unavailable)?;
        Ok(count.max(0) as usize)
    }

    async fn get_by_chain(&self, chain_id: u64) -> Result<Vec<ChainEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT payload FROM {}.chain_events WHERE chain_id = $1 ORDER BY block_number, log_index, id",
            SCHEMA
        ))
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload").map_err(unavailable)?;
            let event: ChainEvent = serde_json::from_str(&payload)
                .map_err(|e| StoreError::Corrupt(format!("chain {}: {}", chain_id, e)))?;
            events.push(event);
        }
        sort_events(&mut events);
        Ok(events)
    }

    async fn insert_many(&self, chain_id: u64, events: &[ChainEvent]) -> Result<usize, StoreError> {
        validate_batch(chain_id, events)?;
        let total = events.len();
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        for event in events {
            let payload = serde_json::to_string(event).map_err(|e| StoreError::Insert {
                chain_id,
                total,
                reason: e.to_string(),
            })?;
            let result = sqlx::query(&format!(
                "INSERT INTO {}.chain_events (chain_id, id, block_number, log_index, kind, payload)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (chain_id, id) DO UPDATE SET
                    block_number = EXCLUDED.block_number,
                    log_index = EXCLUDED.log_index,
                    kind = EXCLUDED.kind,
                    payload = EXCLUDED.payload",
                SCHEMA
            ))
            .bind(chain_id as i64)
            .bind(&event.id)
            .bind(event.block_number as i64)
            .bind(event.log_index as i64)
            .bind(event.kind.as_str())
            .bind(payload)
            .execute(tx.as_mut())
            .await;

            if let Err(e) = result {
                if let Err(rollback_err) = tx.rollback().await {
                    log::warn!("Rollback for chain {} failed: {}", chain_id, rollback_err);
                }
                return Err(insert_error(chain_id, total, e));
            }
        }

        tx.commit()
            .await
            .map_err(|e| insert_error(chain_id, total, e))?;
        Ok(total)
    }

    async fn last_block_by_chain(&self, chain_id: u64) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT MAX(block_number) AS last_block FROM {}.chain_events WHERE chain_id = $1",
            SCHEMA
        ))
        .bind(chain_id as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        let last: Option<i64> = row.try_get("last_block").map_err(unavailable)?;
        Ok(last.map(|b| b.max(0) as u64))
    }

    async fn clear_chain(&self, chain_id: u64) -> Result<(), StoreError> {
        sqlx::query(&format!("DELETE FROM {}.chain_events WHERE chain_id = $1", SCHEMA))
            .bind(chain_id as i64)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("DELETE FROM {}.chain_events", SCHEMA))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

fn stat_from_row(row: &sqlx::postgres::PgRow) -> Result<Stat, StoreError> {
    let chain_id: i64 = row.try_get("chain_id").map_err(unavailable)?;
    let source: Option<String> = row.try_get("source").map_err(unavailable)?;
    let last_block: i64 = row.try_get("last_block").map_err(unavailable)?;
    let last_extracted_at: DateTime<Utc> = row.try_get("last_extracted_at").map_err(unavailable)?;
    Ok(Stat {
        chain_id: chain_id as u64,
        version: row.try_get("version").map_err(unavailable)?,
        last_extracted_at,
        success: row.try_get("success").map_err(unavailable)?,
        source: source.as_deref().and_then(ExtractorKind::parse),
        last_block: last_block.max(0) as u64,
    })
}

#[async_trait]
impl StatStore for PgStore {
    async fn get(&self, chain_id: u64) -> Result<Option<Stat>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT chain_id, version, last_extracted_at, success, source, last_block
             FROM {}.chain_stats WHERE chain_id = $1",
            SCHEMA
        ))
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.as_ref().map(stat_from_row).transpose()
    }

    async fn get_or_create(&self, chain_id: u64, version: &str) -> Result<Stat, StoreError> {
        if let Some(stat) = StatStore::get(self, chain_id).await? {
            return Ok(stat);
        }
        let stat = Stat::new(chain_id, version);
        sqlx::query(&format!(
            "INSERT INTO {}.chain_stats (chain_id, version, last_extracted_at, success, source, last_block)
             VALUES ($1, $2, $3, $4, NULL, 0)
             ON CONFLICT (chain_id) DO NOTHING",
            SCHEMA
        ))
        .bind(chain_id as i64)
        .bind(&stat.version)
        .bind(stat.last_extracted_at)
        .bind(stat.success)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        // A concurrent creator may have won the insert.
        Ok(StatStore::get(self, chain_id).await?.unwrap_or(stat))
    }

    async fn upsert(&self, stat: &Stat) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO {}.chain_stats (chain_id, version, last_extracted_at, success, source, last_block)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (chain_id) DO UPDATE SET
                version = EXCLUDED.version,
                last_extracted_at = EXCLUDED.last_extracted_at,
                success = EXCLUDED.success,
                source = EXCLUDED.source,
                last_block = EXCLUDED.last_block",
            SCHEMA
        ))
        .bind(stat.chain_id as i64)
        .bind(&stat.version)
        .bind(stat.last_extracted_at)
        .bind(stat.success)
        .bind(stat.source.map(|s| s.as_str()))
        .bind(stat.last_block as i64)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("DELETE FROM {}.chain_stats", SCHEMA))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
