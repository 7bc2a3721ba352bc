//! Read-through analysis cache for the exchange news analyzer.
//!
//! Analyses live in a durable store (PostgreSQL). A Valkey/Redis backend
//! keeps disposable copies, refreshed through a per-key single-flight
//! coordinator so a burst of reads for one news item computes it once.

pub mod analysis;
pub mod cache;
pub mod config;
pub mod error;
pub mod http_retry;
pub mod metrics;
pub mod server;
pub mod source;
pub mod store;
