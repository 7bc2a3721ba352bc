//! Analysis records served by the cache.
//!
//! An [`AnalysisEntry`] is owned by the durable store. Cached copies are
//! disposable projections of it and may vanish at any time.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AnalyzerError, Result};

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 256;

/// Longest TTL an entry may carry: one year.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Number of base64 characters kept by [`AnalysisKey::derive`].
const DERIVED_KEY_LEN: usize = 7;

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '~')
}

/// Identifier of one news item's analysis result. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AnalysisKey(String);

impl AnalysisKey {
    /// Validate and wrap a key.
    ///
    /// Keys end up in cache keys and URL paths, so only ASCII alphanumerics
    /// and `-_.:~` are accepted.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(AnalyzerError::InvalidKey("key is empty".to_string()));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(AnalyzerError::InvalidKey(format!(
                "key is {} bytes, limit is {}",
                raw.len(),
                MAX_KEY_LEN
            )));
        }
        if let Some(c) = raw.chars().find(|c| !is_key_char(*c)) {
            return Err(AnalyzerError::InvalidKey(format!(
                "key contains forbidden character {:?}",
                c
            )));
        }
        Ok(Self(raw))
    }

    /// Canonical identifier of a news item from its source, the source's own
    /// id and its publish time.
    ///
    /// SHA-256 over `source|source_id|published_at`, URL-safe base64, first
    /// seven characters. Stable across processes.
    pub fn derive(source: &str, source_id: &str, published_at: DateTime<Utc>) -> Self {
        let raw = format!("{}|{}|{}", source, source_id, published_at.to_rfc3339());
        let digest = Sha256::digest(raw.as_bytes());
        let mut encoded = URL_SAFE_NO_PAD.encode(digest);
        encoded.truncate(DERIVED_KEY_LEN);
        Self(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnalysisKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AnalysisKey {
    type Err = AnalyzerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for AnalysisKey {
    type Error = AnalyzerError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AnalysisKey> for String {
    fn from(key: AnalysisKey) -> Self {
        key.0
    }
}

/// One analysis result with the time it was computed and how long it stays fresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisEntry {
    pub key: AnalysisKey,
    pub payload: serde_json::Value,
    pub computed_at: DateTime<Utc>,
    #[serde(rename = "ttl_secs", with = "ttl_secs")]
    pub ttl: Duration,
}

impl AnalysisEntry {
    pub fn new(key: AnalysisKey, payload: serde_json::Value, ttl: Duration) -> Self {
        Self {
            key,
            payload,
            computed_at: Utc::now(),
            ttl,
        }
    }

    /// Override the computation time (entries loaded from storage keep theirs).
    pub fn computed_at(mut self, computed_at: DateTime<Utc>) -> Self {
        self.computed_at = computed_at;
        self
    }

    /// Time since computation, clamped to zero when `computed_at` is ahead of `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.computed_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

}

/// Reject TTLs above [`MAX_TTL`].
pub fn check_ttl(ttl: Duration) -> Result<Duration> {
    if ttl > MAX_TTL {
        return Err(AnalyzerError::InvalidRequest(format!(
            "ttl_secs {} exceeds the limit of {}",
            ttl.as_secs(),
            MAX_TTL.as_secs()
        )));
    }
    Ok(ttl)
}

/// Serde helper: Duration ↔ u64 whole seconds, bounded by `MAX_TTL`
mod ttl_secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(ttl.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        super::check_ttl(Duration::from_secs(secs)).map_err(D::Error::custom)
    }
}
