pub mod handlers;
pub mod state;

use crate::config::Config;
use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use state::AppState;
use std::time::Duration;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

/// How often expired in-process entries and old invalidation marks are swept
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

const VERSION_HEADER: &str = "x-news-analyzer-version";

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::serve_metrics))
        .route("/latest", get(handlers::analysis::latest_analyses))
        .route("/analysis/batch", post(handlers::analysis::batch_analysis))
        .route(
            "/analysis/{key}",
            get(handlers::analysis::get_analysis)
                .put(handlers::analysis::put_analysis)
                .delete(handlers::analysis::delete_analysis),
        )
        .layer(middleware::from_fn(version_header))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn version_header(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Periodically prune invalidation marks and expired in-process cache entries.
fn spawn_janitor(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            interval.tick().await;
            let marks = state.cache.prune_invalidations();
            let purged = state
                .memory_backend
                .as_ref()
                .map(|backend| backend.purge_expired())
                .unwrap_or(0);
            debug!(
                "Janitor pruned {} invalidation marks, {} expired cache entries",
                marks, purged
            );
        }
    });
}

/// Start the Axum HTTP server
pub async fn start(
    config: Config,
    metrics: Option<PrometheusHandle>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);

    let mut state = AppState::from_config(config).await?;
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }
    spawn_janitor(state.clone());

    let app = build_router(state.clone());

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("🚀 Server listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Waiting for {} in-flight refreshes", state.cache.in_flight());
    state.cache.drain().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
