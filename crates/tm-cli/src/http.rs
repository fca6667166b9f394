//! HTTP + WebSocket transport.
//!
//! REST routes share one session behind a mutex. Every WebSocket
//! connection gets its own forked session, so streams never interleave.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::service::{
    Action, CheckpointRequest, ForwardRequest, InitRequest, ManifoldRequest, Service,
    TrainRequest, TrainSequenceRequest,
};
use crate::session::SessionError;

pub type AppState = Arc<Mutex<Service>>;

// --- Errors ---

pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError(SessionError::BadRequest(e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

// --- Router ---

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(config))
        .route("/memory", get(memory))
        .route("/checkpoints", get(checkpoints))
        .route("/init", post(init))
        .route("/forward", post(forward))
        .route("/train", post(train))
        .route("/train_sequence", post(train_sequence))
        .route("/manifold", post(manifold))
        .route("/reset", post(reset))
        .route("/save", post(save))
        .route("/load", post(load))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    service: Service,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(Arc::new(Mutex::new(service)));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// --- Handlers ---

async fn health(State(state): State<AppState>) -> Json<Value> {
    let svc = state.lock().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessionId": svc.session().id(),
        "steps": svc.session().steps(),
    }))
}

async fn config(State(state): State<AppState>) -> Json<Value> {
    Json(state.lock().await.config())
}

async fn memory(State(state): State<AppState>) -> Json<Value> {
    Json(state.lock().await.memory_state())
}

async fn checkpoints(State(state): State<AppState>) -> ApiResult {
    Ok(Json(state.lock().await.checkpoints()?))
}

async fn init(
    State(state): State<AppState>,
    payload: Result<Json<InitRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    Ok(Json(state.lock().await.init(req)?))
}

async fn forward(
    State(state): State<AppState>,
    payload: Result<Json<ForwardRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    Ok(Json(state.lock().await.forward(req)?))
}

async fn train(
    State(state): State<AppState>,
    payload: Result<Json<TrainRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    Ok(Json(state.lock().await.train(req)?))
}

async fn train_sequence(
    State(state): State<AppState>,
    payload: Result<Json<TrainSequenceRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    Ok(Json(state.lock().await.train_sequence(req)?))
}

async fn manifold(
    State(state): State<AppState>,
    payload: Result<Json<ManifoldRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    Ok(Json(state.lock().await.manifold(req)?))
}

async fn reset(State(state): State<AppState>) -> Json<Value> {
    Json(state.lock().await.reset())
}

async fn save(
    State(state): State<AppState>,
    payload: Result<Json<CheckpointRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    Ok(Json(state.lock().await.save(req)?))
}

async fn load(
    State(state): State<AppState>,
    payload: Result<Json<CheckpointRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = payload?;
    Ok(Json(state.lock().await.load(req)?))
}

// --- WebSocket ---

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let forked = state.lock().await.fork();
    match forked {
        Ok(service) => ws.on_upgrade(move |socket| handle_socket(socket, service)),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn handle_socket(mut socket: WebSocket, mut service: Service) {
    let id = service.session().id();
    tracing::info!(session = %id, "websocket connected");

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(session = %id, "websocket error: {e}");
                break;
            }
        };
        let reply = match msg {
            Message::Text(text) => handle_ws_text(&mut service, text.as_str()),
            Message::Close(_) => break,
            _ => continue,
        };
        if socket.send(Message::Text(reply.into())).await.is_err() {
            break;
        }
    }

    tracing::info!(session = %id, "websocket closed");
}

/// Decode one `{ "action": ... }` message, run it, and encode the reply.
pub fn handle_ws_text(service: &mut Service, text: &str) -> String {
    let reply = match serde_json::from_str::<Action>(text) {
        Ok(action) => match service.dispatch(action) {
            Ok(result) => json!({ "ok": true, "result": result }),
            Err(e) => json!({ "ok": false, "error": e.to_string() }),
        },
        Err(e) => json!({ "ok": false, "error": format!("bad message: {e}") }),
    };
    reply.to_string()
}
