//! REST façade: thin routing glue between the HTTP surface and the session
//! registry / execution adapter.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::connection::ConnectionRegistry;
use crate::engine::ExecutionEngine;
use crate::error::{GatewayError, Result};
use crate::executor::Executor;
use crate::middleware::{admission_limit, handle_panic, normalize_json_content_type, request_log};
use crate::protocol::{
    AddPinsPayload, ClearPinsPayload, ExecRequest, ExecResponse, FingerprintPayload, Ja3Payload,
    ProxyPayload, SessionConfig,
};
use crate::session::SessionRegistry;
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub executor: Arc<Executor>,
    pub admission: Arc<AdmissionController>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, engine: Arc<dyn ExecutionEngine>) -> Self {
        let sessions = Arc::new(SessionRegistry::new(engine));
        let admission = Arc::new(AdmissionController::new(config.max_concurrent_requests));
        Self {
            config: Arc::new(config),
            executor: Arc::new(Executor::new(sessions.clone())),
            sessions,
            connections: Arc::new(ConnectionRegistry::new()),
            admission,
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let rest = Router::new()
        .route("/health", get(health))
        .route("/api/v1/session/create", post(create_session))
        .route("/api/v1/session/:id", delete(delete_session))
        .route("/api/v1/session/:id/request", post(session_request))
        .route("/api/v1/request", post(stateless_request))
        .route("/api/v1/session/:id/ja3", post(apply_ja3))
        .route("/api/v1/session/:id/http2", post(apply_http2))
        .route("/api/v1/session/:id/http3", post(apply_http3))
        .route(
            "/api/v1/session/:id/proxy",
            post(set_proxy).delete(clear_proxy),
        )
        .route(
            "/api/v1/session/:id/pins",
            post(add_pins).delete(clear_pins),
        )
        .route("/api/v1/session/:id/ip", get(get_ip))
        // The admission gate covers REST only; WebSocket traffic is not
        // metered here.
        .layer(from_fn_with_state(state.clone(), admission_limit))
        .layer(from_fn(normalize_json_content_type))
        .layer(TimeoutLayer::new(state.config.request_timeout));

    let ws = Router::new().route("/ws", get(websocket_handler));

    Router::new()
        .merge(rest)
        .merge(ws)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(from_fn(request_log))
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::invalid_input(format!("invalid request body: {e}")))
}

fn parse_optional_json<T: DeserializeOwned>(body: &Bytes) -> Result<Option<T>> {
    if body.is_empty() {
        return Ok(None);
    }
    parse_json(body).map(Some)
}

fn success() -> Json<Value> {
    Json(json!({ "status": "success" }))
}

/// Status selection for an executed request: an engine-level failure is
/// carried in the body and reported as a 500, everything else is a 200.
fn exec_response(response: ExecResponse) -> impl IntoResponse {
    let status = if response.error.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(response))
}

pub async fn health_info(state: &AppState) -> Value {
    json!({
        "status": "healthy",
        "sessions": state.sessions.count().await,
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(health_info(&state).await)
}

async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let config: Option<SessionConfig> = parse_optional_json(&body)?;
    let (session_id, _) = state.sessions.create(None, config.as_ref()).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "session_id": session_id, "status": "created" })),
    ))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.sessions.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn session_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let request: ExecRequest = parse_json(&body)?;
    let response = state.executor.execute(&id, &request).await?;
    Ok(exec_response(response))
}

async fn stateless_request(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let request: ExecRequest = parse_json(&body)?;
    let response = state.executor.execute_stateless(&request).await?;
    Ok(exec_response(response))
}

async fn apply_ja3(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let payload: Ja3Payload = parse_json(&body)?;
    state
        .sessions
        .apply_ja3(&id, &payload.ja3, &payload.navigator)
        .await?;
    Ok(success())
}

async fn apply_http2(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let payload: FingerprintPayload = parse_json(&body)?;
    state.sessions.apply_http2(&id, &payload.fingerprint).await?;
    Ok(success())
}

async fn apply_http3(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let payload: FingerprintPayload = parse_json(&body)?;
    state.sessions.apply_http3(&id, &payload.fingerprint).await?;
    Ok(success())
}

async fn set_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let payload: ProxyPayload = parse_json(&body)?;
    state.sessions.set_proxy(&id, &payload.proxy).await?;
    Ok(success())
}

async fn clear_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.sessions.clear_proxy(&id).await?;
    Ok(success())
}

async fn add_pins(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let payload: AddPinsPayload = parse_json(&body)?;
    state.sessions.add_pins(&id, &payload.url, &payload.pins).await?;
    Ok(success())
}

async fn clear_pins(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let payload: ClearPinsPayload = parse_json(&body)?;
    state.sessions.clear_pins(&id, &payload.url).await?;
    Ok(success())
}

async fn get_ip(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let ip = state.sessions.ip(&id).await?;
    Ok(Json(json!({ "ip": ip })))
}
