use crate::{
    cache::{AnalysisCache, CacheBackend, FreshnessPolicy, MemoryBackend},
    config::{CacheBackendType, Config, StoreType},
    source::{AnalysisSource, RemoteSource, StoreSource},
    store::{AnalysisStore, MemoryStore},
};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Read-through analysis cache
    pub cache: AnalysisCache,
    /// In-process cache backend, when selected; purged by the janitor
    pub memory_backend: Option<MemoryBackend>,
    /// Prometheus exporter handle, present once a recorder is installed
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    /// Wrap an already built cache.
    pub fn new(config: Config, cache: AnalysisCache) -> Self {
        Self {
            config: Arc::new(config),
            cache,
            memory_backend: None,
            metrics: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_memory_backend(mut self, backend: MemoryBackend) -> Self {
        self.memory_backend = Some(backend);
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Connect the store, cache backend and computation source named by `config`.
    pub async fn from_config(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let store = build_store(&config).await?;

        let mut memory_backend = None;
        let backend: Arc<dyn CacheBackend> = match config.cache_backend {
            CacheBackendType::Valkey => match connect_valkey(&config.valkey_url).await {
                Ok(backend) => backend,
                Err(e) => {
                    warn!("Valkey unavailable ({}), falling back to in-process cache", e);
                    let backend = MemoryBackend::new();
                    memory_backend = Some(backend.clone());
                    Arc::new(backend)
                }
            },
            CacheBackendType::Memory => {
                let backend = MemoryBackend::new();
                memory_backend = Some(backend.clone());
                Arc::new(backend)
            }
        };

        let source: Arc<dyn AnalysisSource> = match &config.analyzer_url {
            Some(url) => {
                let client = Client::builder()
                    .pool_idle_timeout(Duration::from_secs(90))
                    .pool_max_idle_per_host(10)
                    .build()?;
                info!("Computing misses via analysis producer at {}", url);
                Arc::new(RemoteSource::new(
                    client,
                    url.as_str(),
                    config.analysis_ttl(),
                    Arc::clone(&store),
                ))
            }
            None => Arc::new(StoreSource::new(Arc::clone(&store))),
        };

        let cache = AnalysisCache::builder(backend, store, source)
            .policy(FreshnessPolicy::new(config.grace_window()))
            .refresh_timeout(config.refresh_timeout())
            .build();
        info!(
            "Analysis cache ready (backend: {}, grace: {}s)",
            cache.backend_name(),
            config.grace_window_secs
        );

        let mut state = Self::new(config, cache);
        state.memory_backend = memory_backend;
        Ok(state)
    }
}

async fn build_store(config: &Config) -> Result<Arc<dyn AnalysisStore>, Box<dyn std::error::Error>> {
    match config.store {
        StoreType::Memory => {
            info!("Using in-memory analysis store");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "postgres")]
        StoreType::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or("DATABASE_URL is required when STORE=postgres")?;
            let store = crate::store::PostgresStore::connect(url, config.db_pool_size)?;
            store.ensure_schema().await?;
            info!("Using PostgreSQL analysis store (pool size {})", config.db_pool_size);
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreType::Postgres => Err("STORE=postgres requires the `postgres` feature".into()),
    }
}

#[cfg(feature = "valkey")]
async fn connect_valkey(url: &str) -> crate::error::Result<Arc<dyn CacheBackend>> {
    let backend = crate::cache::ValkeyBackend::connect(url).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "valkey"))]
async fn connect_valkey(_url: &str) -> crate::error::Result<Arc<dyn CacheBackend>> {
    Err(crate::error::AnalyzerError::BackendUnavailable(
        "built without the `valkey` feature".to_string(),
    ))
}
