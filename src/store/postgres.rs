//! PostgreSQL store over a deadpool connection pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::info;

use super::AnalysisStore;
use crate::analysis::{AnalysisEntry, AnalysisKey, MAX_TTL, check_ttl};
use crate::error::{AnalyzerError, Result};

const APPLICATION_NAME: &str = "news_analyzer";

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS analyses (
        key TEXT PRIMARY KEY,
        payload JSONB NOT NULL,
        computed_at TIMESTAMPTZ NOT NULL,
        ttl_secs BIGINT NOT NULL
    )";

const CREATE_INDEX: &str = "
    CREATE INDEX IF NOT EXISTS idx_analyses_computed_at
    ON analyses(computed_at)";

const SELECT_ONE: &str = "
    SELECT payload, computed_at, ttl_secs FROM analyses WHERE key = $1";

const SELECT_LATEST: &str = "
    SELECT key, payload, computed_at, ttl_secs FROM analyses
    ORDER BY computed_at DESC LIMIT $1";

const UPSERT: &str = "
    INSERT INTO analyses (key, payload, computed_at, ttl_secs)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (key) DO UPDATE SET
        payload = EXCLUDED.payload,
        computed_at = EXCLUDED.computed_at,
        ttl_secs = EXCLUDED.ttl_secs";

/// Canonical analysis storage in PostgreSQL.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from a connection URL.
    pub fn connect(database_url: &str, max_size: usize) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.url = Some(database_url.to_string());
        cfg.application_name = Some(APPLICATION_NAME.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(max_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| AnalyzerError::Store(format!("Failed to create pool: {}", e)))?;
        Ok(Self::new(pool))
    }

    /// Create the `analyses` table and its index if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.batch_execute(CREATE_TABLE).await?;
        client.batch_execute(CREATE_INDEX).await?;
        info!("PostgreSQL schema ready");
        Ok(())
    }
}

#[async_trait]
impl AnalysisStore for PostgresStore {
    async fn load(&self, key: &AnalysisKey) -> Result<AnalysisEntry> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(SELECT_ONE, &[&key.as_str()])
            .await?
            .ok_or_else(|| AnalyzerError::NotFound(key.to_string()))?;

        let payload: serde_json::Value = row.try_get(0)?;
        let computed_at: DateTime<Utc> = row.try_get(1)?;
        let ttl_secs: i64 = row.try_get(2)?;
        Ok(entry_from_columns(key.clone(), payload, computed_at, ttl_secs))
    }

    async fn save(&self, entry: &AnalysisEntry) -> Result<()> {
        let ttl_secs = i64::try_from(check_ttl(entry.ttl)?.as_secs())
            .map_err(|e| AnalyzerError::InvalidRequest(e.to_string()))?;
        let client = self.pool.get().await?;
        client
            .execute(
                UPSERT,
                &[
                    &entry.key.as_str(),
                    &entry.payload,
                    &entry.computed_at,
                    &ttl_secs,
                ],
            )
            .await?;
        Ok(())
    }

    async fn latest(&self, limit: usize) -> Result<Vec<AnalysisEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.pool.get().await?;
        let rows = client.query(SELECT_LATEST, &[&limit]).await?;

        rows.iter()
            .map(|row| -> Result<AnalysisEntry> {
                let key: String = row.try_get(0)?;
                Ok(entry_from_columns(
                    AnalysisKey::new(key)?,
                    row.try_get(1)?,
                    row.try_get(2)?,
                    row.try_get(3)?,
                ))
            })
            .collect()
    }
}

/// Out-of-range `ttl_secs` columns are clamped to `0..=MAX_TTL`.
fn entry_from_columns(
    key: AnalysisKey,
    payload: serde_json::Value,
    computed_at: DateTime<Utc>,
    ttl_secs: i64,
) -> AnalysisEntry {
    AnalysisEntry {
        key,
        payload,
        computed_at,
        ttl: Duration::from_secs(ttl_secs.max(0) as u64).min(MAX_TTL),
    }
}
