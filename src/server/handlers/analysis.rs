use super::observed;
use crate::{
    analysis::{AnalysisEntry, AnalysisKey, check_ttl},
    error::{AnalyzerError, Result},
    server::state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

/// Analyses returned by `/latest` when no limit is given
const DEFAULT_LATEST_LIMIT: usize = 15;

/// Upper bound on the `/latest` limit
const MAX_LATEST_LIMIT: usize = 100;

/// Optional caller deadline for a read
#[derive(Debug, Deserialize)]
pub struct ReadParams {
    timeout_ms: Option<u64>,
}

/// Serve one analysis through the read-through cache.
///
/// The `x-cache` header reports `hit`, `stale` or `miss`.
pub async fn get_analysis(
    Path(key): Path<String>,
    Query(params): Query<ReadParams>,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();
    observed("analysis_get", start, read(key, params, &state).await)
}

async fn read(raw: String, params: ReadParams, state: &AppState) -> Result<Response> {
    let key = AnalysisKey::new(raw)?;
    let deadline = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.config.request_timeout());

    let read = state.cache.read_with_deadline(&key, deadline).await?;
    info!("Serving analysis {} ({})", key, read.status.as_str());

    Ok(([("x-cache", read.status.as_str())], Json(read.entry)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PutAnalysis {
    payload: serde_json::Value,
    ttl_secs: Option<u64>,
}

/// Save an analysis to the durable store and refresh its cached copy.
pub async fn put_analysis(
    Path(key): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<PutAnalysis>,
) -> Result<Response> {
    let start = Instant::now();
    let result = async {
        let key = AnalysisKey::new(key)?;
        let ttl = match body.ttl_secs {
            Some(secs) => check_ttl(Duration::from_secs(secs))?,
            None => state.config.analysis_ttl(),
        };
        let entry = state
            .cache
            .put(AnalysisEntry::new(key, body.payload, ttl))
            .await?;
        Ok::<_, AnalyzerError>(Json(entry).into_response())
    }
    .await;
    observed("analysis_put", start, result)
}

/// Drop the cached copy of an analysis. The stored result is untouched.
pub async fn delete_analysis(
    Path(key): Path<String>,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();
    let result = async {
        let key = AnalysisKey::new(key)?;
        state.cache.invalidate(&key).await?;
        info!("Invalidated cached analysis {}", key);
        Ok::<_, AnalyzerError>(StatusCode::NO_CONTENT.into_response())
    }
    .await;
    observed("analysis_delete", start, result)
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    keys: Vec<String>,
}

/// One slot of a batch response; exactly one of `entry` and `error` is set.
#[derive(Debug, Serialize)]
pub struct BatchItem {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<AnalysisEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl BatchItem {
    fn from_result(key: String, result: Result<AnalysisEntry>) -> Self {
        match result {
            Ok(entry) => Self {
                key,
                entry: Some(entry),
                error: None,
                message: None,
            },
            Err(e) => Self {
                key,
                entry: None,
                error: Some(e.code()),
                message: Some(e.to_string()),
            },
        }
    }
}

/// Read several analyses in one request. Items follow the request order.
pub async fn batch_analysis(
    State(state): State<AppState>,
    Json(body): Json<BatchRequest>,
) -> Result<Response> {
    let start = Instant::now();

    let max = state.config.max_batch_keys;
    if body.keys.len() > max {
        let err = AnalyzerError::InvalidRequest(format!(
            "batch of {} keys exceeds the limit of {}",
            body.keys.len(),
            max
        ));
        return observed("analysis_batch", start, Err(err));
    }

    // Invalid keys are answered in place without reaching the cache.
    let parsed: Vec<Result<AnalysisKey>> = body
        .keys
        .iter()
        .map(|raw| AnalysisKey::new(raw.as_str()))
        .collect();
    let valid: Vec<AnalysisKey> = parsed.iter().filter_map(|k| k.as_ref().ok()).cloned().collect();
    let mut fetched = state.cache.get_many(&valid).await.into_iter();

    let items: Vec<BatchItem> = body
        .keys
        .into_iter()
        .zip(parsed)
        .map(|(raw, parsed)| {
            let result = match parsed {
                Ok(_) => fetched.next().unwrap_or_else(|| {
                    Err(AnalyzerError::computation(
                        raw.as_str(),
                        "missing batch result",
                    ))
                }),
                Err(e) => Err(e),
            };
            BatchItem::from_result(raw, result)
        })
        .collect();

    info!("Served batch of {} analyses", items.len());
    observed("analysis_batch", start, Ok(Json(items).into_response()))
}

#[derive(Debug, Deserialize)]
pub struct LatestParams {
    limit: Option<usize>,
}

/// Newest analyses from the durable store, most recent first.
pub async fn latest_analyses(
    Query(params): Query<LatestParams>,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LATEST_LIMIT)
        .min(MAX_LATEST_LIMIT);

    let result = state.cache.latest(limit).await.map(|entries| {
        info!("Serving {} latest analyses", entries.len());
        Json(entries).into_response()
    });
    observed("latest", start, result)
}
