//! Computation sources invoked on a cache miss.
//!
//! A source turns an [`AnalysisKey`] into a freshly computed (or freshly
//! loaded) [`AnalysisEntry`]. The cache calls it through the single-flight
//! coordinator, so each source sees at most one call per key at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::analysis::{AnalysisEntry, AnalysisKey, check_ttl};
use crate::error::{AnalyzerError, Result};
use crate::http_retry::{RetryConfig, fetch_with_retry};
use crate::store::AnalysisStore;

/// Produces the analysis for a key, or fails.
#[async_trait]
pub trait AnalysisSource: Send + Sync {
    async fn compute(&self, key: &AnalysisKey) -> Result<AnalysisEntry>;
}

/// Reads the canonical entry back from the durable store.
#[derive(Clone)]
pub struct StoreSource {
    store: Arc<dyn AnalysisStore>,
}

impl StoreSource {
    pub fn new(store: Arc<dyn AnalysisStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AnalysisSource for StoreSource {
    async fn compute(&self, key: &AnalysisKey) -> Result<AnalysisEntry> {
        self.store.load(key).await
    }
}

/// Source backed by an async callback. See [`source_fn`].
#[derive(Clone)]
pub struct FnSource<F> {
    f: F,
}

/// Wrap an async closure as an [`AnalysisSource`].
///
/// ```ignore
/// let source = source_fn(|key: AnalysisKey| async move {
///     Ok(AnalysisEntry::new(key, json!({"label": "trading"}), ttl))
/// });
/// ```
pub fn source_fn<F, Fut>(f: F) -> FnSource<F>
where
    F: Fn(AnalysisKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AnalysisEntry>> + Send + 'static,
{
    FnSource { f }
}

#[async_trait]
impl<F, Fut> AnalysisSource for FnSource<F>
where
    F: Fn(AnalysisKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AnalysisEntry>> + Send + 'static,
{
    async fn compute(&self, key: &AnalysisKey) -> Result<AnalysisEntry> {
        (self.f)(key.clone()).await
    }
}

/// Body returned by the analysis producer.
#[derive(Debug, Deserialize)]
struct RemoteAnalysis {
    payload: serde_json::Value,
    #[serde(default)]
    computed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

/// Fetches analyses from an external producer over HTTP and records them in
/// the durable store before handing them to the cache.
#[derive(Clone)]
pub struct RemoteSource {
    client: Client,
    base_url: String,
    retry: RetryConfig,
    default_ttl: Duration,
    store: Arc<dyn AnalysisStore>,
}

impl RemoteSource {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        default_ttl: Duration,
        store: Arc<dyn AnalysisStore>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryConfig {
                timeout: Some(Duration::from_secs(10)),
                ..RetryConfig::default()
            },
            default_ttl,
            store,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn url_for(&self, key: &AnalysisKey) -> String {
        format!("{}/analysis/{}", self.base_url, key)
    }
}

#[async_trait]
impl AnalysisSource for RemoteSource {
    async fn compute(&self, key: &AnalysisKey) -> Result<AnalysisEntry> {
        let url = self.url_for(key);
        let response = match fetch_with_retry(&self.client, &url, &self.retry).await {
            Ok(response) => response,
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => {
                return Err(AnalyzerError::NotFound(key.to_string()));
            }
            Err(e) => return Err(AnalyzerError::computation(key.as_str(), e)),
        };

        let remote: RemoteAnalysis = response
            .json()
            .await
            .map_err(|e| AnalyzerError::computation(key.as_str(), e))?;

        let ttl = match remote.ttl_secs {
            Some(secs) => check_ttl(Duration::from_secs(secs))
                .map_err(|e| AnalyzerError::computation(key.as_str(), e))?,
            None => self.default_ttl,
        };
        let entry = AnalysisEntry {
            key: key.clone(),
            payload: remote.payload,
            computed_at: remote.computed_at.unwrap_or_else(Utc::now),
            ttl,
        };

        self.store.save(&entry).await?;
        info!("Analysis for {} fetched from producer and stored", key);
        Ok(entry)
    }
}
