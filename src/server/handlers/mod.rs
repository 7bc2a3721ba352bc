pub mod analysis;
pub mod health;

use crate::{error::Result, metrics};
use axum::response::Response;
use std::time::Instant;

/// Record request count and latency for a finished handler.
fn observed(endpoint: &'static str, start: Instant, result: Result<Response>) -> Result<Response> {
    let status = match &result {
        Ok(response) => response.status(),
        Err(e) => e.status(),
    };
    metrics::record_request(endpoint, status.as_u16());
    metrics::record_duration(endpoint, start);
    result
}
