//! Read-through analysis cache.
//!
//! [`AnalysisCache`] sits between the HTTP layer and the durable store. It
//! serves fresh entries from a [`CacheBackend`], serves stale ones while a
//! background refresh runs, and funnels every recomputation for a key
//! through one [`SingleFlight`] ticket.

pub mod backend;
pub mod freshness;
pub mod manager;
pub mod singleflight;

pub use backend::{CacheBackend, CacheWrite, MemoryBackend};
#[cfg(feature = "valkey")]
pub use backend::ValkeyBackend;
pub use freshness::{Freshness, FreshnessPolicy};
pub use manager::{AnalysisCache, AnalysisCacheBuilder, CacheRead, CacheStatus};
pub use singleflight::SingleFlight;
