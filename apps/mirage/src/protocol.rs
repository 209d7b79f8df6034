use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Closed set of WebSocket message types.
///
/// Client-originated messages outside this set are answered with an `error`
/// reply; the connection stays open. `Unknown` is the guarded default for
/// tags this build does not recognize and is never sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Error,
    Ping,
    Pong,
    Session,
    CreateSession,
    DeleteSession,
    ApplyJa3,
    ApplyHttp2,
    ApplyHttp3,
    SetProxy,
    ClearProxy,
    AddPins,
    ClearPins,
    GetIp,
    Health,
    #[serde(other)]
    Unknown,
}

/// Wire envelope for every WebSocket message, both directions.
///
/// `id` is the caller-supplied correlation token; replies echo it verbatim.
/// An absent ID stays absent on the way back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl WsMessage {
    pub fn new(kind: MessageType, id: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind,
            id: id.into(),
            payload,
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, "", None)
    }

    pub fn pong(id: impl Into<String>) -> Self {
        Self::new(MessageType::Pong, id, None)
    }

    pub fn response(id: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::Response, id, Some(payload))
    }

    pub fn error(id: impl Into<String>, message: impl AsRef<str>) -> Self {
        Self::new(
            MessageType::Error,
            id,
            Some(json!({ "error": message.as_ref() })),
        )
    }

    pub fn success(id: impl Into<String>) -> Self {
        Self::response(id, json!({ "status": "success" }))
    }

    /// Server→client notification of the session now bound to the connection.
    pub fn session_info(session_id: &str) -> Self {
        Self::new(
            MessageType::Session,
            "",
            Some(json!({ "session_id": session_id })),
        )
    }
}

/// A header value in a request body: either a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

/// Per-request option set, applied on top of the session's own policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub follow_redirects: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_redirects: bool,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub max_redirects: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proxy: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_cookie: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub browser: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub force_http1: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub force_http3: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure_skip_verify: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ignore_body: bool,
}

/// Logical request carried by `POST .../request` bodies and WebSocket
/// `request` payloads.
///
/// `headers` and `ordered_headers` are mutually exclusive, as are `body` and
/// `body_b64`; the execution adapter rejects conflicting shapes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, HeaderValues>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordered_headers: Option<Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_b64: Option<String>,
    #[serde(default)]
    pub options: RequestOptions,
}

/// Normalized result of one executed request.
///
/// `body` and `body_b64` are mutually exclusive on the way out: textual
/// content goes in `body`, binary content is base64-encoded into `body_b64`
/// so callers can tell the two apart. An engine-level failure fills `error`
/// and leaves the rest at their zero values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResponse {
    #[serde(default)]
    pub id: String,
    pub status_code: u16,
    pub status: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<CookieOut>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub url: String,
}

impl ExecResponse {
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: error.into(),
            ..Default::default()
        }
    }
}

/// SameSite policy of a returned cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Default,
    Lax,
    Strict,
    None,
}

impl SameSite {
    /// Maps the engine's numeric SameSite code. Codes outside the known
    /// range yield `Option::None` so the field is omitted from output.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Default),
            2 => Some(Self::Lax),
            3 => Some(Self::Strict),
            4 => Some(Self::None),
            _ => Option::None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieOut {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub http_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<SameSite>,
}

/// Session configuration accepted by `POST /api/v1/session/create` and the
/// WebSocket `create_session` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub browser: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proxy: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub max_redirects: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordered_headers: Option<Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

// Payloads for the session-scoped management operations, shared by the REST
// handlers and the WebSocket dispatcher.

#[derive(Debug, Clone, Deserialize)]
pub struct Ja3Payload {
    pub ja3: String,
    #[serde(default)]
    pub navigator: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintPayload {
    pub fingerprint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyPayload {
    pub proxy: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddPinsPayload {
    pub url: String,
    pub pins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClearPinsPayload {
    pub url: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
