//! Cache backends: best-effort key/value stores with expiry.
//!
//! The cache is never a source of truth. Callers treat every backend error
//! as a miss and fall back to the durable store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[cfg(feature = "valkey")]
use redis::aio::ConnectionManager;
#[cfg(feature = "valkey")]
use tracing::info;

use crate::error::Result;

/// Longest expiry the in-process backend schedules. Longer TTLs are capped.
const MAX_MEMORY_RETENTION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// One write in a [`CacheBackend::set_many`] batch: key, bytes and TTL hint.
pub type CacheWrite = (String, Vec<u8>, Duration);

/// Key/value store with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch the bytes stored under `key`, `None` on miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Fetch several keys at once. Results line up with `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Store `value` under `key`, expiring after `ttl_hint`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl_hint: Duration) -> Result<()>;

    /// Store several values at once. Stops at the first failure.
    async fn set_many(&self, writes: Vec<CacheWrite>) -> Result<()> {
        for (key, value, ttl_hint) in writes {
            self.set(&key, value, ttl_hint).await?;
        }
        Ok(())
    }

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Short name for logs and the health endpoint.
    fn name(&self) -> &'static str;
}

/// Expiry instant for `ttl`, capped at `MAX_MEMORY_RETENTION`.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_MEMORY_RETENTION)).unwrap_or(now)
}

#[derive(Clone, Debug)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// In-process backend used in development and tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries whose expiry has passed. Call periodically.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries.retain(|_, value| value.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.entries.get(key) {
            if value.expires_at > Instant::now() {
                return Ok(Some(value.bytes.clone()));
            }
            // Expired: drop the read guard before removing
            drop(value);
            self.entries.remove(key);
            debug!(key, "memory cache entry expired");
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_hint: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at: expiry(Instant::now(), ttl_hint),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Valkey/Redis backend over a multiplexed, auto-reconnecting connection.
#[cfg(feature = "valkey")]
#[derive(Clone)]
pub struct ValkeyBackend {
    conn: ConnectionManager,
}

#[cfg(feature = "valkey")]
impl ValkeyBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Valkey at {}", url);
        Ok(Self { conn })
    }
}

/// `EX` takes whole seconds; round up so entries never expire early.
#[cfg(feature = "valkey")]
fn expiry_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(feature = "valkey")]
#[async_trait]
impl CacheBackend for ValkeyBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let values = cmd
            .query_async::<Vec<Option<Vec<u8>>>>(&mut conn)
            .await?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_hint: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(expiry_secs(ttl_hint))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_many(&self, writes: Vec<CacheWrite>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (key, value, ttl_hint) in writes {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(expiry_secs(ttl_hint))
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "valkey"
    }
}
