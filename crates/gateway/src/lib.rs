//! HTTP and WebSocket gateway for LocalAPI.
//!
//! Exposes the turn engine over REST (`POST /responses` and the read
//! endpoints) and a streaming WebSocket (`/ws/respond`).
//!
//! Built on Axum for high performance async HTTP.

pub mod api;

use axum::extract::DefaultBodyLimit;
use axum::extract::State;
use axum::{Router, http::Method, http::header, response::Json, routing::get};
use localapi_config::AppConfig;
use localapi_core::store::Store;
use localapi_engine::ResponseOrchestrator;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state for the gateway.
pub struct AppState {
    pub orchestrator: Arc<ResponseOrchestrator>,
    pub store: Arc<dyn Store>,
    pub config: AppConfig,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(orchestrator: Arc<ResponseOrchestrator>, config: AppConfig) -> Self {
        Self {
            store: orchestrator.store().clone(),
            orchestrator,
            config,
            start_time: chrono::Utc::now(),
        }
    }
}

pub type SharedState = Arc<AppState>;

/// Build the Axum router with all gateway routes.
///
/// Layers applied:
/// - CORS for browser clients (GET/POST, JSON bodies)
/// - Request body size limit (1 MB)
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(3600));

    let health = Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone());

    Router::new()
        .merge(health)
        .merge(api::api_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve the gateway until `shutdown` resolves.
///
/// In-flight requests are allowed to finish once shutdown starts.
pub async fn start<F>(state: SharedState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.config.gateway.host, state.config.gateway.port);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Gateway stopped");
    Ok(())
}

// --- Handlers ---

/// `status` is `degraded` while the inference backend is unreachable;
/// the gateway itself still answers.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backend: String,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let reachable = state.orchestrator.backend_healthy().await;
    let (status, backend) = if reachable {
        ("ok", "ok")
    } else {
        ("degraded", "unreachable")
    };
    Json(HealthResponse {
        status: status.into(),
        version: env!("CARGO_PKG_VERSION").into(),
        backend: backend.into(),
    })
}
