//! Durable store adapters holding canonical analysis results.

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::analysis::{AnalysisEntry, AnalysisKey};
use crate::error::{AnalyzerError, Result};

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Typed access to canonical analysis results.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Load the analysis for `key`, `NotFound` when absent.
    async fn load(&self, key: &AnalysisKey) -> Result<AnalysisEntry>;

    /// Insert or replace the analysis for `entry.key`. Last write wins.
    async fn save(&self, entry: &AnalysisEntry) -> Result<()>;

    /// Up to `limit` analyses, newest `computed_at` first.
    async fn latest(&self, limit: usize) -> Result<Vec<AnalysisEntry>>;
}

/// In-process store for development and tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<AnalysisKey, AnalysisEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn load(&self, key: &AnalysisKey) -> Result<AnalysisEntry> {
        self.entries
            .get(key)
            .map(|entry| entry.clone())
            .ok_or_else(|| AnalyzerError::NotFound(key.to_string()))
    }

    async fn save(&self, entry: &AnalysisEntry) -> Result<()> {
        self.entries.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn latest(&self, limit: usize) -> Result<Vec<AnalysisEntry>> {
        let mut entries: Vec<AnalysisEntry> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by(|a, b| {
            b.computed_at
                .cmp(&a.computed_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        entries.truncate(limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn entry(key: &str, label: &str) -> AnalysisEntry {
        AnalysisEntry::new(
            AnalysisKey::new(key).unwrap(),
            json!({ "label": label }),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let store = MemoryStore::new();
        let key = AnalysisKey::new("nope").unwrap();
        assert_eq!(
            store.load(&key).await,
            Err(AnalyzerError::NotFound("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn save_then_load() {
        let store = MemoryStore::new();
        let saved = entry("k1", "trading");
        store.save(&saved).await.unwrap();
        assert_eq!(store.load(&saved.key).await.unwrap(), saved);
    }

    #[tokio::test]
    async fn save_overwrites() {
        let store = MemoryStore::new();
        store.save(&entry("k1", "trading")).await.unwrap();
        store.save(&entry("k1", "engineering")).await.unwrap();

        let loaded = store.load(&AnalysisKey::new("k1").unwrap()).await.unwrap();
        assert_eq!(loaded.payload["label"], "engineering");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn latest_is_newest_first_and_limited() {
        let store = MemoryStore::new();
        let now = chrono::Utc::now();
        for (key, age) in [("old", 300), ("newest", 0), ("middle", 60)] {
            let saved = entry(key, "trading").computed_at(now - chrono::Duration::seconds(age));
            store.save(&saved).await.unwrap();
        }

        let latest = store.latest(2).await.unwrap();
        let keys: Vec<&str> = latest.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["newest", "middle"]);
        assert!(store.latest(0).await.unwrap().is_empty());
    }
}
