//! REST and WebSocket API for the turn engine.
//!
//! Endpoints:
//!
//! - `POST /responses`               — Run one turn, get the full reply
//! - `GET  /responses/{id}`          — A stored response with its output text
//! - `GET  /threads/{id}/messages`   — Recent thread history (`?limit=1..=500`)
//! - `GET  /threads/{id}/summary`    — The folded thread summary
//! - `GET  /config`                  — Non-secret runtime configuration
//! - `GET  /ws/respond`              — WebSocket: one request, streamed reply

use axum::{
    Router,
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use localapi_config::AppConfig;
use localapi_core::error::Error;
use localapi_core::event::StreamEvent;
use localapi_core::message::{Message, ThreadId};
use localapi_core::provider::Usage;
use localapi_core::response::{ResponseDetail, ResponseStatus};
use localapi_core::store::{MessageWindow, Store};
use localapi_engine::TurnRequest;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::SharedState;

/// Default page size for thread history.
const DEFAULT_MESSAGE_LIMIT: usize = 50;
/// Largest accepted `limit` for thread history.
const MAX_MESSAGE_LIMIT: usize = 500;

// ── Router ────────────────────────────────────────────────────────────────

pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/responses", post(create_response_handler))
        .route("/responses/{id}", get(get_response_handler))
        .route("/threads/{id}/messages", get(list_messages_handler))
        .route("/threads/{id}/summary", get(get_summary_handler))
        .route("/config", get(get_config_handler))
        .route("/ws/respond", get(ws_respond_handler))
        .with_state(state)
}

// ── DTOs ──────────────────────────────────────────────────────────────────

/// Body of a completed `POST /responses`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateResponseBody {
    pub response_id: String,
    pub thread_id: ThreadId,
    pub output_text: String,
    pub status: ResponseStatus,
    pub usage: Usage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            response_id: None,
            thread_id: None,
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(message)))
}

/// Map an engine error to an HTTP status.
fn from_engine_error(err: &Error) -> ApiError {
    let status = match err {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::BackendUnavailable(_) | Error::BackendStreamError(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {err}");
    }
    api_error(status, err.to_string())
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub thread_id: ThreadId,
    /// Empty until the thread has been folded
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folded_through: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    #[serde(flatten)]
    config: AppConfig,
    prompt_budget_tokens: usize,
    uptime_secs: i64,
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn create_response_handler(
    State(state): State<SharedState>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<CreateResponseBody>, ApiError> {
    info!(
        store = request.store,
        input_len = request.input_text.len(),
        "POST /responses"
    );

    // The turn itself is detached, so a dropped connection still finishes it
    let outcome = state
        .orchestrator
        .respond(request, None)
        .await
        .map_err(|e| from_engine_error(&e))?;

    let response = outcome.response;
    if response.status != ResponseStatus::Completed {
        return Err((
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse {
                error: response.error.unwrap_or_else(|| "turn failed".into()),
                response_id: Some(response.response_id),
                thread_id: Some(response.thread_id),
            }),
        ));
    }

    Ok(Json(CreateResponseBody {
        response_id: response.response_id,
        thread_id: response.thread_id,
        output_text: response.output_text,
        status: response.status,
        usage: response.usage,
    }))
}

async fn get_response_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ResponseDetail>, ApiError> {
    state
        .store
        .get_response_detail(&id)
        .await
        .map_err(|e| from_engine_error(&e.into()))?
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Response '{id}' not found")))
}

async fn require_thread(state: &SharedState, thread_id: &ThreadId) -> Result<(), ApiError> {
    let exists = state
        .store
        .thread_exists(thread_id)
        .await
        .map_err(|e| from_engine_error(&e.into()))?;
    if exists {
        Ok(())
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Thread '{thread_id}' not found"),
        ))
    }
}

async fn list_messages_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    if !(1..=MAX_MESSAGE_LIMIT).contains(&limit) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("limit must be between 1 and {MAX_MESSAGE_LIMIT}"),
        ));
    }

    let thread_id = ThreadId(id);
    require_thread(&state, &thread_id).await?;

    let messages = state
        .store
        .list_recent_messages(&thread_id, MessageWindow::latest(limit))
        .await
        .map_err(|e| from_engine_error(&e.into()))?;
    Ok(Json(messages))
}

async fn get_summary_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let thread_id = ThreadId(id);
    require_thread(&state, &thread_id).await?;

    let summary = state
        .store
        .get_summary(&thread_id)
        .await
        .map_err(|e| from_engine_error(&e.into()))?;

    Ok(Json(SummaryResponse {
        thread_id,
        folded_through: summary.as_ref().map(|s| s.folded_through),
        summary: summary.map(|s| s.content).unwrap_or_default(),
    }))
}

async fn get_config_handler(State(state): State<SharedState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        config: state.config.redacted(),
        prompt_budget_tokens: state.config.context.budget(),
        uptime_secs: (chrono::Utc::now() - state.start_time).num_seconds(),
    })
}

// ── WebSocket ─────────────────────────────────────────────────────────────

/// `GET /ws/respond` — one turn per connection.
///
/// Protocol:
/// - Client → Server: a single `TurnRequest` JSON text frame
/// - Server → Client: `StreamEvent` frames (`start`, `delta`*, `end` | `error`), then close
async fn ws_respond_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_turn(socket, state))
}

/// `false` once the socket is gone. An event that cannot be encoded is
/// skipped, never sent as an empty frame.
async fn send_event(socket: &mut WebSocket, event: &StreamEvent) -> bool {
    let Some(json) = encode_frame(event) else {
        return true;
    };
    socket.send(WsMessage::Text(json.into())).await.is_ok()
}

fn encode_frame<T: Serialize>(event: &T) -> Option<String> {
    serde_json::to_string(event)
        .inspect_err(|e| error!("Dropping WebSocket frame that failed to serialize: {e}"))
        .ok()
}

fn error_event(message: impl Into<String>) -> StreamEvent {
    let trace_id = uuid::Uuid::new_v4().to_string();
    let message = message.into();
    warn!(trace_id = %trace_id, "WebSocket turn rejected: {message}");
    StreamEvent::Error {
        message,
        trace_id: Some(trace_id),
    }
}

async fn handle_ws_turn(mut socket: WebSocket, state: SharedState) {
    debug!("WebSocket connection established");

    let raw = loop {
        match socket.recv().await {
            Some(Ok(WsMessage::Text(text))) => break text,
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => continue, // ignore binary, ping, pong
        }
    };

    let request: TurnRequest = match serde_json::from_str(raw.as_str()) {
        Ok(request) => request,
        Err(e) => {
            send_event(&mut socket, &error_event(format!("Invalid request: {e}"))).await;
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel(64);
    let orchestrator = state.orchestrator.clone();
    let turn = tokio::spawn(async move { orchestrator.respond(request, Some(tx)).await });

    let mut connected = true;
    while let Some(event) = rx.recv().await {
        if !send_event(&mut socket, &event).await {
            debug!("WebSocket client went away mid-turn");
            connected = false;
            break;
        }
    }
    drop(rx);

    match turn.await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            if connected {
                send_event(&mut socket, &error_event(e.to_string())).await;
            }
        }
        Err(e) => error!("Turn task panicked: {e}"),
    }

    if connected {
        let _ = socket.send(WsMessage::Close(None)).await;
    }
    debug!("WebSocket connection closed");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{AppState, build_router};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use localapi_core::error::ProviderError;
    use localapi_core::provider::{Provider, ProviderRequest, ProviderResponse};
    use localapi_core::store::Store;
    use localapi_engine::ResponseOrchestrator;
    use localapi_store::InMemoryStore;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Provider with a fixed reply, or a fixed failure.
    pub(crate) struct CannedProvider {
        reply: Result<String, ProviderError>,
    }

    impl CannedProvider {
        pub(crate) fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
            }
        }

        pub(crate) fn down() -> Self {
            Self {
                reply: Err(ProviderError::Network("connection refused".into())),
            }
        }
    }

    #[async_trait]
    impl Provider for CannedProvider {
        fn name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            let content = self.reply.clone()?;
            Ok(ProviderResponse::text(content, Some(Usage::new(8, 2)), "mock-model"))
        }

        async fn health_check(&self) -> Result<bool, ProviderError> {
            self.reply.as_ref().map(|_| true).map_err(Clone::clone)
        }
    }

    fn app_with(provider: CannedProvider) -> (Router, Arc<dyn Store>) {
        let config = AppConfig {
            api_key: Some("sk-secret-value".into()),
            ..Default::default()
        };
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let orchestrator = Arc::new(ResponseOrchestrator::new(Arc::new(provider), store.clone(), &config));
        let state = Arc::new(AppState::new(orchestrator, config));
        (build_router(state), store)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_response_returns_output() {
        let (app, _) = app_with(CannedProvider::ok("Hi there!"));

        let response = app
            .oneshot(post_json("/responses", serde_json::json!({ "input_text": "Hello!" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: CreateResponseBody = body_json(response).await;
        assert_eq!(body.output_text, "Hi there!");
        assert_eq!(body.status, ResponseStatus::Completed);
        assert_eq!(body.usage, Usage::new(8, 2));
        assert!(!body.response_id.is_empty());
    }

    #[tokio::test]
    async fn empty_input_is_bad_request() {
        let (app, _) = app_with(CannedProvider::ok("unused"));

        let response = app
            .oneshot(post_json("/responses", serde_json::json!({ "input_text": "   " })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_input_is_rejected() {
        let (app, _) = app_with(CannedProvider::ok("unused"));

        let response = app
            .oneshot(post_json("/responses", serde_json::json!({ "store": true })))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn backend_failure_is_bad_gateway_with_ids() {
        let (app, store) = app_with(CannedProvider::down());

        let response = app
            .oneshot(post_json("/responses", serde_json::json!({ "input_text": "Hello?" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body: ErrorResponse = body_json(response).await;
        let response_id = body.response_id.unwrap();
        assert!(body.thread_id.is_some());
        assert!(body.error.contains("connection refused"));

        let stored = store.get_response(&response_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ResponseStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_previous_response_is_not_found() {
        let (app, _) = app_with(CannedProvider::ok("unused"));

        let response = app
            .oneshot(post_json(
                "/responses",
                serde_json::json!({ "input_text": "hi", "previous_response_id": "nope" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stored_response_can_be_fetched() {
        let (app, _) = app_with(CannedProvider::ok("Stored reply"));

        let response = app
            .clone()
            .oneshot(post_json("/responses", serde_json::json!({ "input_text": "Hi" })))
            .await
            .unwrap();
        let created: CreateResponseBody = body_json(response).await;

        let response = app
            .clone()
            .oneshot(get(&format!("/responses/{}", created.response_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail: ResponseDetail = body_json(response).await;
        assert_eq!(detail.output_text, "Stored reply");
        assert_eq!(detail.thread_id, created.thread_id);

        let response = app.oneshot(get("/responses/does-not-exist")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn thread_messages_are_chronological_and_limited() {
        let (app, _) = app_with(CannedProvider::ok("ack"));
        let thread = "thread-http";

        for text in ["one", "two"] {
            let response = app
                .clone()
                .oneshot(post_json(
                    "/responses",
                    serde_json::json!({ "input_text": text, "thread_id": thread }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(get(&format!("/threads/{thread}/messages")))
            .await
            .unwrap();
        let messages: Vec<Message> = body_json(response).await;
        let texts: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, ["one", "ack", "two", "ack"]);

        let response = app
            .clone()
            .oneshot(get(&format!("/threads/{thread}/messages?limit=2")))
            .await
            .unwrap();
        let messages: Vec<Message> = body_json(response).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "two");

        for bad in ["0", "501"] {
            let response = app
                .clone()
                .oneshot(get(&format!("/threads/{thread}/messages?limit={bad}")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        let response = app.oneshot(get("/threads/ghost/messages")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn summary_is_empty_before_any_fold() {
        let (app, store) = app_with(CannedProvider::ok("ack"));
        let thread = store.create_thread().await.unwrap();

        let response = app
            .clone()
            .oneshot(get(&format!("/threads/{}/summary", thread.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: SummaryResponse = body_json(response).await;
        assert_eq!(body.summary, "");
        assert!(body.folded_through.is_none());

        store.upsert_summary(&thread.id, "Ada likes tea", 6).await.unwrap();
        let response = app
            .oneshot(get(&format!("/threads/{}/summary", thread.id)))
            .await
            .unwrap();
        let body: SummaryResponse = body_json(response).await;
        assert_eq!(body.summary, "Ada likes tea");
        assert_eq!(body.folded_through, Some(6));
    }

    #[tokio::test]
    async fn config_hides_api_key() {
        let (app, _) = app_with(CannedProvider::ok("unused"));

        let response = app.oneshot(get("/config")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = body_json(response).await;
        assert!(!body.to_string().contains("sk-secret-value"));
        assert_eq!(body["prompt_budget_tokens"], 4915);
        assert_eq!(body["context"]["max_context_messages"], 20);
    }

    #[tokio::test]
    async fn ws_route_exists() {
        // No upgrade headers, so the handshake is refused, but the route is there
        let (app, _) = app_with(CannedProvider::ok("unused"));

        let response = app.oneshot(get("/ws/respond")).await.unwrap();
        assert_ne!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unencodable_frame_is_skipped() {
        let mut bad = std::collections::HashMap::new();
        bad.insert((1, 2), "tuple keys are not JSON object keys");
        assert!(encode_frame(&bad).is_none());

        let frame = encode_frame(&StreamEvent::Delta { text: "hi".into() }).unwrap();
        assert!(frame.contains("\"delta\""));
    }
}
