//! Middleware chain for the REST surface: request-ID propagation with a
//! completion log line, JSON content-type normalization, the admission
//! gate, and the panic recovery boundary.

use std::any::Any;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::handlers::AppState;

fn generate_request_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}

/// Honors an inbound `X-Request-ID`, generates one otherwise, reflects it on
/// the response, and logs the exchange on completion.
pub async fn request_log(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(generate_request_id);

    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let mut response = next.run(req).await;

    debug!(
        "[{request_id}] {method} {path} - {} - {:?}",
        response.status(),
        start.elapsed()
    );
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Write methods without a `Content-Type` are treated as JSON; anything
/// declared as a non-JSON type is refused outright.
pub async fn normalize_json_content_type(mut req: Request, next: Next) -> Response {
    if matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH) {
        match req.headers().get(CONTENT_TYPE) {
            None => {
                req.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            Some(value) => {
                let is_json = value
                    .to_str()
                    .map(|v| {
                        let essence = v.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
                        essence == "application/json" || essence.ends_with("+json")
                    })
                    .unwrap_or(false);
                if !is_json {
                    return (
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        Json(json!({
                            "error": "unsupported media type",
                            "status": StatusCode::UNSUPPORTED_MEDIA_TYPE.as_u16(),
                        })),
                    )
                        .into_response();
                }
            }
        }
    }
    next.run(req).await
}

/// The admission gate. Over-capacity callers are rejected before any
/// handler logic runs; the permit is held for the whole request so release
/// happens on every exit path.
pub async fn admission_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    match state.admission.try_acquire() {
        Some(_permit) => next.run(req).await,
        None => GatewayError::CapacityExceeded.into_response(),
    }
}

/// Recovery boundary for the catch-panic layer: the panic is logged, the
/// caller gets a generic internal error.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    error!("panic while handling request: {detail}");
    GatewayError::Internal(detail).into_response()
}
