//! API key broker
//!
//! Single-binary HTTP service that:
//! 1. Loads a prioritized list of upstream API keys with rpm/rpd ceilings
//! 2. Hands out the first key within both ceilings on `GET /get-api-key`
//! 3. Tells callers how long to back off when every key is used up
//! 4. Reports per-key usage on `GET /health`

mod config;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::Json;
use axum::response::IntoResponse;
use axum::routing::get;
use key_pool::{Acquisition, Pool};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    pool: Arc<Pool>,
    requests_total: Arc<AtomicU64>,
    blocked_total: Arc<AtomicU64>,
    started_at: Instant,
}

impl AppState {
    fn new(pool: Arc<Pool>) -> Self {
        Self {
            pool,
            requests_total: Arc::new(AtomicU64::new(0)),
            blocked_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Response body of `/get-api-key`. A blocked request carries an empty key
/// and the back-off message in `model`.
#[derive(Debug, Serialize)]
struct KeyResponse {
    #[serde(rename = "apiKey")]
    api_key: String,
    model: String,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize, cors: CorsLayer) -> Router {
    Router::new()
        .route("/get-api-key", get(get_api_key_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// CORS for browser callers. No configured origins means any origin.
fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let origin = if allowed_origins.is_empty() {
        AllowOrigin::any()
    } else {
        let origins = allowed_origins
            .iter()
            .map(|o| HeaderValue::from_str(o).with_context(|| format!("invalid origin {o}")))
            .collect::<Result<Vec<_>>>()?;
        AllowOrigin::list(origins)
    };
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET]))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting key-broker");

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let credentials = config.credentials()?;
    let pool = Pool::new(credentials).context("invalid key pool configuration")?;

    info!(
        listen_addr = %config.server.listen_addr,
        keys = pool.len(),
        max_connections = config.server.max_connections,
        "configuration loaded"
    );

    let cors = cors_layer(&config.server.allowed_origins)?;
    let app = build_router(
        AppState::new(Arc::new(pool)),
        config.server.max_connections,
        cors,
    );

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Hand out one key per call.
async fn get_api_key_handler(State(state): State<AppState>) -> Json<KeyResponse> {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let body = match state.pool.acquire() {
        Acquisition::Assigned(assignment) => {
            debug!(request_id = %request_id, model = %assignment.label, "key issued");
            KeyResponse {
                api_key: assignment.identity.expose().clone(),
                model: assignment.label,
            }
        }
        Acquisition::Blocked(reason) => {
            state.blocked_total.fetch_add(1, Ordering::Relaxed);
            warn!(request_id = %request_id, reason = reason.label(), "key request blocked");
            KeyResponse {
                api_key: String::new(),
                model: reason.message().to_string(),
            }
        }
    };
    Json(body)
}

/// Pool health plus service counters. 200 while any key is available, 503
/// otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.pool.health();
    let status_code = if body["keys_available"].as_u64().unwrap_or(0) > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    body["uptime_seconds"] = state.started_at.elapsed().as_secs().into();
    body["requests_served"] = state.requests_total.load(Ordering::Relaxed).into();
    body["requests_blocked"] = state.blocked_total.load(Ordering::Relaxed).into();

    (status_code, Json(body))
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
