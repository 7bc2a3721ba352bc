use std::env;
use std::time::Duration;

/// Durable store selection
#[derive(Clone, Debug, PartialEq)]
pub enum StoreType {
    /// In-process map; contents are lost on restart (default for dev)
    Memory,
    Postgres,
}

/// Cache backend selection
#[derive(Clone, Debug, PartialEq)]
pub enum CacheBackendType {
    Memory,
    Valkey,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub is_dev: bool,
    /// Durable store backend
    pub store: StoreType,
    /// PostgreSQL connection URL (required when store = Postgres)
    pub database_url: Option<String>,
    /// Maximum pooled database connections
    pub db_pool_size: usize,
    /// Cache backend
    pub cache_backend: CacheBackendType,
    /// Valkey/Redis URL (used when cache_backend = Valkey)
    pub valkey_url: String,
    /// TTL given to analyses computed without one (default: 3600)
    pub analysis_ttl_secs: u64,
    /// Stale-serve window past TTL (default: 300)
    pub grace_window_secs: u64,
    /// Default deadline for a read, in milliseconds (default: 5000)
    pub request_timeout_ms: u64,
    /// Upper bound on one refresh (default: 30)
    pub refresh_timeout_secs: u64,
    /// External analysis producer; when set, misses are computed remotely
    pub analyzer_url: Option<String>,
    /// Most keys accepted by one batch read (default: 100)
    pub max_batch_keys: usize,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT and the
    /// store connection are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        // Port: required in prod, defaults to 8000 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        // Store: memory in dev, postgres in prod unless overridden
        let default_store = if is_dev { "memory" } else { "postgres" };
        let store = match env::var("STORE")
            .unwrap_or_else(|_| default_store.to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" | "postgresql" => StoreType::Postgres,
            "memory" => StoreType::Memory,
            other => return Err(format!("unknown STORE: {}", other).into()),
        };

        let database_url = env::var("DATABASE_URL").ok();
        if store == StoreType::Postgres && database_url.is_none() {
            return Err("DATABASE_URL is required when STORE=postgres".into());
        }

        let db_pool_size = env::var("DB_POOL_SIZE")
            .unwrap_or_else(|_| "16".to_string())
            .parse()
            .unwrap_or(16);

        let cache_backend = match env::var("CACHE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "valkey" | "redis" => CacheBackendType::Valkey,
            _ => CacheBackendType::Memory,
        };
        let valkey_url = env::var("REDIS_URL")
            .or_else(|_| env::var("VALKEY_URL"))
            .unwrap_or_else(|_| "redis://redis:6379/0".to_string());

        let analysis_ttl_secs = env::var("ANALYSIS_TTL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .unwrap_or(3600);
        let grace_window_secs = env::var("GRACE_WINDOW_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);
        let request_timeout_ms = env::var("REQUEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000);
        let refresh_timeout_secs = env::var("REFRESH_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let analyzer_url = env::var("ANALYZER_URL").ok().filter(|url| !url.is_empty());

        let max_batch_keys = env::var("MAX_BATCH_KEYS")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .unwrap_or(100);

        Ok(Config {
            port,
            is_dev,
            store,
            database_url,
            db_pool_size,
            cache_backend,
            valkey_url,
            analysis_ttl_secs,
            grace_window_secs,
            request_timeout_ms,
            refresh_timeout_secs,
            analyzer_url,
            max_batch_keys,
        })
    }

    /// Development defaults without touching the environment.
    pub fn dev() -> Self {
        Config {
            port: 8000,
            is_dev: true,
            store: StoreType::Memory,
            database_url: None,
            db_pool_size: 16,
            cache_backend: CacheBackendType::Memory,
            valkey_url: "redis://redis:6379/0".to_string(),
            analysis_ttl_secs: 3600,
            grace_window_secs: 300,
            request_timeout_ms: 5000,
            refresh_timeout_secs: 30,
            analyzer_url: None,
            max_batch_keys: 100,
        }
    }

    pub fn analysis_ttl(&self) -> Duration {
        Duration::from_secs(self.analysis_ttl_secs)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serialize all env-var tests to prevent races between parallel test threads.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Set env vars, run `f`, then restore original state.
    ///
    /// `set`: vars to set; `unset`: vars to remove before running `f`.
    fn with_env(set: &[(&str, &str)], unset: &[&str], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let save_set: Vec<(&str, Option<String>)> = set
            .iter()
            .map(|(k, _)| (*k, std::env::var(k).ok()))
            .collect();
        let save_unset: Vec<(&str, Option<String>)> =
            unset.iter().map(|k| (*k, std::env::var(k).ok())).collect();

        for (k, v) in set {
            // SAFETY: serialized by ENV_LOCK, no other thread modifies env vars concurrently.
            unsafe { std::env::set_var(k, v) };
        }
        for k in unset {
            unsafe { std::env::remove_var(k) };
        }

        f();

        for (k, old) in save_set.into_iter().chain(save_unset) {
            match old {
                Some(v) => unsafe { std::env::set_var(k, v) },
                None => unsafe { std::env::remove_var(k) },
            }
        }
    }

    const ALL_VARS: &[&str] = &[
        "DEV_MODE",
        "PORT",
        "STORE",
        "DATABASE_URL",
        "DB_POOL_SIZE",
        "CACHE_BACKEND",
        "REDIS_URL",
        "VALKEY_URL",
        "ANALYSIS_TTL_SECS",
        "GRACE_WINDOW_SECS",
        "REQUEST_TIMEOUT_MS",
        "REFRESH_TIMEOUT_SECS",
        "ANALYZER_URL",
        "MAX_BATCH_KEYS",
    ];

    #[test]
    fn dev_mode_uses_defaults() {
        with_env(&[("DEV_MODE", "true")], &ALL_VARS[1..], || {
            let config = Config::from_env().expect("should succeed in dev mode");
            assert!(config.is_dev);
            assert_eq!(config.port, 8000);
            assert_eq!(config.store, StoreType::Memory);
            assert_eq!(config.cache_backend, CacheBackendType::Memory);
            assert_eq!(config.valkey_url, "redis://redis:6379/0");
            assert_eq!(config.analysis_ttl(), Duration::from_secs(3600));
            assert_eq!(config.grace_window(), Duration::from_secs(300));
            assert_eq!(config.request_timeout(), Duration::from_millis(5000));
            assert_eq!(config.refresh_timeout(), Duration::from_secs(30));
            assert_eq!(config.db_pool_size, 16);
            assert!(config.analyzer_url.is_none());
            assert_eq!(config.max_batch_keys, 100);
        });
    }

    #[test]
    fn prod_mode_requires_port() {
        with_env(&[("DATABASE_URL", "postgres://db/news")], &["DEV_MODE", "PORT"], || {
            let result = Config::from_env();
            assert!(result.is_err(), "Should fail without PORT in prod mode");
        });
    }

    #[test]
    fn prod_mode_defaults_to_postgres_and_requires_database_url() {
        with_env(&[("PORT", "8000")], &["DEV_MODE", "STORE", "DATABASE_URL"], || {
            let result = Config::from_env();
            assert!(result.is_err(), "Should fail without DATABASE_URL in prod mode");
        });
    }

    #[test]
    fn prod_mode_with_database_url() {
        with_env(
            &[("PORT", "8080"), ("DATABASE_URL", "postgres://db/news")],
            &["DEV_MODE", "STORE"],
            || {
                let config = Config::from_env().unwrap();
                assert!(!config.is_dev);
                assert_eq!(config.port, 8080);
                assert_eq!(config.store, StoreType::Postgres);
                assert_eq!(config.database_url.as_deref(), Some("postgres://db/news"));
            },
        );
    }

    #[test]
    fn unknown_store_is_rejected() {
        with_env(&[("DEV_MODE", "true"), ("STORE", "sqlite")], &[], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn cache_backend_valkey() {
        with_env(
            &[("DEV_MODE", "true"), ("CACHE_BACKEND", "valkey")],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.cache_backend, CacheBackendType::Valkey);
            },
        );
    }

    #[test]
    fn cache_backend_redis_alias() {
        with_env(
            &[("DEV_MODE", "true"), ("CACHE_BACKEND", "redis")],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.cache_backend, CacheBackendType::Valkey);
            },
        );
    }

    #[test]
    fn redis_url_takes_precedence_over_valkey_url() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("REDIS_URL", "redis://cache-a:6379/0"),
                ("VALKEY_URL", "redis://cache-b:6379/0"),
            ],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.valkey_url, "redis://cache-a:6379/0");
            },
        );
    }

    #[test]
    fn timings_parsed() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("ANALYSIS_TTL_SECS", "10"),
                ("GRACE_WINDOW_SECS", "5"),
                ("REQUEST_TIMEOUT_MS", "250"),
                ("REFRESH_TIMEOUT_SECS", "2"),
                ("MAX_BATCH_KEYS", "8"),
            ],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.analysis_ttl(), Duration::from_secs(10));
                assert_eq!(config.grace_window(), Duration::from_secs(5));
                assert_eq!(config.request_timeout(), Duration::from_millis(250));
                assert_eq!(config.refresh_timeout(), Duration::from_secs(2));
                assert_eq!(config.max_batch_keys, 8);
            },
        );
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        with_env(
            &[("DEV_MODE", "true"), ("ANALYSIS_TTL_SECS", "an hour")],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.analysis_ttl_secs, 3600);
            },
        );
    }

    #[test]
    fn empty_analyzer_url_is_ignored() {
        with_env(&[("DEV_MODE", "true"), ("ANALYZER_URL", "")], &[], || {
            let config = Config::from_env().unwrap();
            assert!(config.analyzer_url.is_none());
        });
    }
}
