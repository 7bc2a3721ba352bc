//! Freshness classification for cached entries.
//!
//! A cached entry is `Fresh` up to its TTL, servable-while-refreshing for a
//! further grace window, and `Expired` beyond that.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::analysis::AnalysisEntry;

/// Default grace window past TTL during which stale entries are still served.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Within TTL: serve as-is.
    Fresh,
    /// Past TTL but within the grace window: serve and refresh in background.
    StaleGrace,
    /// Beyond the grace window: block on a refresh.
    Expired,
}

/// Classify an entry computed at `computed_at` with the given TTL.
///
/// Boundaries are inclusive: an age of exactly `ttl` is `Fresh`, exactly
/// `ttl + grace_window` is `StaleGrace`. A `computed_at` in the future
/// (clock skew) is `Fresh`.
pub fn classify(
    computed_at: DateTime<Utc>,
    ttl: Duration,
    grace_window: Duration,
    now: DateTime<Utc>,
) -> Freshness {
    let age = match now.signed_duration_since(computed_at).to_std() {
        Ok(age) => age,
        Err(_) => return Freshness::Fresh,
    };

    if age <= ttl {
        Freshness::Fresh
    } else if age <= ttl.saturating_add(grace_window) {
        Freshness::StaleGrace
    } else {
        Freshness::Expired
    }
}

/// Staleness policy applied by the cache manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub grace_window: Duration,
}

impl FreshnessPolicy {
    pub fn new(grace_window: Duration) -> Self {
        Self { grace_window }
    }

    pub fn classify(&self, entry: &AnalysisEntry, now: DateTime<Utc>) -> Freshness {
        classify(entry.computed_at, entry.ttl, self.grace_window, now)
    }

    /// Classify a cached copy written by a refresh at `cached_at`.
    ///
    /// The TTL runs from the later of `computed_at` and `cached_at`: a refresh
    /// that reloads an old entry from the store revalidates it.
    pub fn classify_cached(
        &self,
        entry: &AnalysisEntry,
        cached_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Freshness {
        let since = cached_at.map_or(entry.computed_at, |at| at.max(entry.computed_at));
        classify(since, entry.ttl, self.grace_window, now)
    }

    /// How long the cache backend should keep an entry: its TTL plus grace.
    pub fn retention(&self, entry: &AnalysisEntry) -> Duration {
        entry.ttl.saturating_add(self.grace_window)
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisKey;

    const TTL: Duration = Duration::from_secs(10);
    const GRACE: Duration = Duration::from_secs(5);

    fn aged(secs: i64) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now - chrono::Duration::seconds(secs), now)
    }

    #[test]
    fn fresh_within_ttl() {
        let (computed_at, now) = aged(9);
        assert_eq!(classify(computed_at, TTL, GRACE, now), Freshness::Fresh);
    }

    #[test]
    fn stale_within_grace() {
        let (computed_at, now) = aged(12);
        assert_eq!(classify(computed_at, TTL, GRACE, now), Freshness::StaleGrace);
    }

    #[test]
    fn expired_beyond_grace() {
        let (computed_at, now) = aged(20);
        assert_eq!(classify(computed_at, TTL, GRACE, now), Freshness::Expired);
    }

    #[test]
    fn boundaries_are_inclusive() {
        let (computed_at, now) = aged(10);
        assert_eq!(classify(computed_at, TTL, GRACE, now), Freshness::Fresh);

        let (computed_at, now) = aged(15);
        assert_eq!(classify(computed_at, TTL, GRACE, now), Freshness::StaleGrace);

        let now = Utc::now();
        let computed_at = now - chrono::Duration::milliseconds(15_001);
        assert_eq!(classify(computed_at, TTL, GRACE, now), Freshness::Expired);
    }

    #[test]
    fn future_timestamp_is_fresh() {
        let now = Utc::now();
        let computed_at = now + chrono::Duration::seconds(3600);
        assert_eq!(classify(computed_at, TTL, GRACE, now), Freshness::Fresh);
    }

    #[test]
    fn zero_grace_goes_straight_to_expired() {
        let (computed_at, now) = aged(11);
        assert_eq!(
            classify(computed_at, TTL, Duration::ZERO, now),
            Freshness::Expired
        );
    }

    #[test]
    fn policy_uses_entry_ttl() {
        let policy = FreshnessPolicy::new(GRACE);
        let now = Utc::now();
        let entry = AnalysisEntry::new(
            AnalysisKey::new("k").unwrap(),
            serde_json::Value::Null,
            TTL,
        )
        .computed_at(now - chrono::Duration::seconds(12));

        assert_eq!(policy.classify(&entry, now), Freshness::StaleGrace);
        assert_eq!(policy.retention(&entry), Duration::from_secs(15));
    }

    #[test]
    fn cached_copy_counts_from_the_later_timestamp() {
        let policy = FreshnessPolicy::new(GRACE);
        let now = Utc::now();
        let entry = AnalysisEntry::new(
            AnalysisKey::new("k").unwrap(),
            serde_json::Value::Null,
            TTL,
        )
        .computed_at(now - chrono::Duration::seconds(3600));

        assert_eq!(policy.classify_cached(&entry, None, now), Freshness::Expired);
        let reloaded = Some(now - chrono::Duration::seconds(2));
        assert_eq!(policy.classify_cached(&entry, reloaded, now), Freshness::Fresh);
        let reloaded = Some(now - chrono::Duration::seconds(12));
        assert_eq!(
            policy.classify_cached(&entry, reloaded, now),
            Freshness::StaleGrace
        );
    }
}
