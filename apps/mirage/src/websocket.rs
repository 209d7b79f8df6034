//! WebSocket connection lifecycle: per-connection read and write pumps, the
//! server-initiated heartbeat, and the message dispatcher.
//!
//! Each accepted socket gets two tasks started together: the read pump
//! (arrival-ordered message handling, heartbeat-response bookkeeping) and
//! the write pump (heartbeat ticker, shutdown close handshake). Both
//! observe — never own — the connection's one-shot close signal. When
//! either pump exits, the connection is removed from the registry and its
//! bound session, if any, is deleted unconditionally.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{generate_connection_id, MessageSink, WsConnection};
use crate::handlers::{health_info, AppState};
use crate::protocol::{
    AddPinsPayload, ClearPinsPayload, ExecRequest, FingerprintPayload, Ja3Payload, MessageType,
    ProxyPayload, SessionConfig, WsMessage,
};

/// Hard cap on one inbound frame.
const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Heartbeats go out at 9/10 of the read-deadline window so a healthy peer
/// always has a response in flight before the deadline lands.
fn ping_period(pong_wait: Duration) -> Duration {
    pong_wait * 9 / 10
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket: WebSocket| async move {
            let (sink, stream) = socket.split();
            run_connection(Box::new(sink), stream, state).await;
        })
}

/// Drives one connection from `Established` to `Closed`.
pub(crate) async fn run_connection<S>(sink: MessageSink, stream: S, state: AppState)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let conn_id = generate_connection_id();
    let conn = Arc::new(WsConnection::new(
        conn_id.clone(),
        sink,
        state.config.pong_wait,
        state.config.write_wait,
    ));
    state.connections.add(conn.clone());
    info!("WebSocket connection {conn_id} established");

    let writer = tokio::spawn(write_pump(conn.clone(), state.shutdown.clone()));
    read_pump(stream, conn.clone(), state.clone()).await;

    conn.close();
    let _ = writer.await;

    state.connections.remove(&conn_id);
    let session_id = conn.session_id();
    if !session_id.is_empty() {
        // A client that disconnects without delete_session still has its
        // session reclaimed.
        if let Err(e) = state.sessions.delete(&session_id).await {
            warn!("failed to delete session {session_id} on disconnect: {e}");
        }
    }
    info!("WebSocket connection {conn_id} closed (session: {session_id})");
}

/// Reads frames in arrival order until the deadline expires, the stream
/// errors or ends, or the close signal fires. Heartbeat responses extend
/// the deadline and never reach the dispatcher; a handler failure becomes a
/// correlated `error` reply, and a failed write of that reply ends the
/// pump.
async fn read_pump<S>(mut stream: S, conn: Arc<WsConnection>, state: AppState)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let close = conn.closed_signal();
    conn.extend_read_deadline();

    loop {
        let remaining = conn
            .read_deadline()
            .saturating_duration_since(Instant::now());

        let frame = tokio::select! {
            _ = close.cancelled() => return,
            next = timeout(remaining, stream.next()) => match next {
                Err(_) => {
                    debug!("connection {} read deadline expired", conn.id());
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    debug!("connection {} read error: {e}", conn.id());
                    return;
                }
                Ok(Some(Ok(frame))) => frame,
            },
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => return,
            // Transport-level frames are not part of the protocol.
            _ => continue,
        };

        let message: WsMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(e) => {
                let reply = WsMessage::error("", format!("invalid message: {e}"));
                if conn.write_message(&reply).await.is_err() {
                    return;
                }
                continue;
            }
        };

        if message.kind == MessageType::Pong {
            conn.extend_read_deadline();
            continue;
        }

        if let Err(e) = dispatch(&state, &conn, &message).await {
            warn!("connection {} handler error: {e}", conn.id());
            let reply = WsMessage::error(message.id.clone(), e.to_string());
            if conn.write_message(&reply).await.is_err() {
                return;
            }
        }
    }
}

/// Sends a heartbeat every ping period. A failed send marks the connection
/// dead. Server shutdown triggers one best-effort close handshake.
async fn write_pump(conn: Arc<WsConnection>, shutdown: CancellationToken) {
    let close = conn.closed_signal();
    let period = ping_period(conn.pong_wait());
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = close.cancelled() => return,
            _ = shutdown.cancelled() => {
                let _ = conn.write_close_frame().await;
                conn.close();
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = conn.write_message(&WsMessage::ping()).await {
                    debug!("connection {} heartbeat failed: {e}", conn.id());
                    conn.close();
                    return;
                }
            }
        }
    }
}

fn decode_payload<T: DeserializeOwned>(message: &WsMessage, what: &str) -> anyhow::Result<T> {
    let payload = message.payload.clone().unwrap_or(Value::Null);
    serde_json::from_value(payload).map_err(|e| anyhow!("invalid {what} payload: {e}"))
}

fn active_session(conn: &WsConnection) -> anyhow::Result<String> {
    let session_id = conn.session_id();
    if session_id.is_empty() {
        bail!("no active session");
    }
    Ok(session_id)
}

/// Routes one client message. Errors bubble to the read pump, which turns
/// them into a correlated `error` reply.
async fn dispatch(
    state: &AppState,
    conn: &Arc<WsConnection>,
    message: &WsMessage,
) -> anyhow::Result<()> {
    match message.kind {
        MessageType::Request => handle_request(state, conn, message).await,
        MessageType::Ping => conn.write_message(&WsMessage::pong(message.id.clone())).await,
        MessageType::CreateSession => handle_create_session(state, conn, message).await,
        MessageType::DeleteSession => handle_delete_session(state, conn, message).await,
        MessageType::ApplyJa3 => {
            let session_id = active_session(conn)?;
            let payload: Ja3Payload = decode_payload(message, "JA3")?;
            state
                .sessions
                .apply_ja3(&session_id, &payload.ja3, &payload.navigator)
                .await?;
            conn.write_message(&WsMessage::success(message.id.clone())).await
        }
        MessageType::ApplyHttp2 => {
            let session_id = active_session(conn)?;
            let payload: FingerprintPayload = decode_payload(message, "HTTP2")?;
            state
                .sessions
                .apply_http2(&session_id, &payload.fingerprint)
                .await?;
            conn.write_message(&WsMessage::success(message.id.clone())).await
        }
        MessageType::ApplyHttp3 => {
            let session_id = active_session(conn)?;
            let payload: FingerprintPayload = decode_payload(message, "HTTP3")?;
            state
                .sessions
                .apply_http3(&session_id, &payload.fingerprint)
                .await?;
            conn.write_message(&WsMessage::success(message.id.clone())).await
        }
        MessageType::SetProxy => {
            let session_id = active_session(conn)?;
            let payload: ProxyPayload = decode_payload(message, "proxy")?;
            state.sessions.set_proxy(&session_id, &payload.proxy).await?;
            conn.write_message(&WsMessage::success(message.id.clone())).await
        }
        MessageType::ClearProxy => {
            let session_id = active_session(conn)?;
            state.sessions.clear_proxy(&session_id).await?;
            conn.write_message(&WsMessage::success(message.id.clone())).await
        }
        MessageType::AddPins => {
            let session_id = active_session(conn)?;
            let payload: AddPinsPayload = decode_payload(message, "pins")?;
            state
                .sessions
                .add_pins(&session_id, &payload.url, &payload.pins)
                .await?;
            conn.write_message(&WsMessage::success(message.id.clone())).await
        }
        MessageType::ClearPins => {
            let session_id = active_session(conn)?;
            let payload: ClearPinsPayload = decode_payload(message, "clear pins")?;
            state.sessions.clear_pins(&session_id, &payload.url).await?;
            conn.write_message(&WsMessage::success(message.id.clone())).await
        }
        MessageType::GetIp => {
            let session_id = active_session(conn)?;
            let ip = state.sessions.ip(&session_id).await?;
            conn.write_message(&WsMessage::response(message.id.clone(), json!({ "ip": ip })))
                .await
        }
        MessageType::Health => {
            let payload = health_info(state).await;
            conn.write_message(&WsMessage::response(message.id.clone(), payload))
                .await
        }
        MessageType::Response
        | MessageType::Error
        | MessageType::Pong
        | MessageType::Session
        | MessageType::Unknown => bail!("unknown message type"),
    }
}

async fn handle_request(
    state: &AppState,
    conn: &Arc<WsConnection>,
    message: &WsMessage,
) -> anyhow::Result<()> {
    let mut request: ExecRequest = decode_payload(message, "request")?;
    if !message.id.is_empty() {
        request.id = message.id.clone();
    }

    let response = state.executor.execute(&conn.session_id(), &request).await?;
    if !response.error.is_empty() {
        bail!("{}", response.error);
    }

    conn.write_message(&WsMessage::response(
        message.id.clone(),
        serde_json::to_value(&response)?,
    ))
    .await
}

async fn handle_create_session(
    state: &AppState,
    conn: &Arc<WsConnection>,
    message: &WsMessage,
) -> anyhow::Result<()> {
    let config: SessionConfig = match &message.payload {
        Some(value) if !value.is_null() => serde_json::from_value(value.clone())
            .map_err(|e| anyhow!("invalid session config: {e}"))?,
        _ => SessionConfig::default(),
    };

    let (session_id, _) = state.sessions.create(None, Some(&config)).await?;

    let old = conn.session_id();
    conn.set_session_id(&session_id);
    state.connections.rebind_session(conn, &old, &session_id);

    conn.write_message(&WsMessage::response(
        message.id.clone(),
        json!({ "session_id": session_id, "status": "created" }),
    ))
    .await?;

    // Out-of-band note of the connection's new active session.
    let _ = conn.write_message(&WsMessage::session_info(&session_id)).await;
    Ok(())
}

async fn handle_delete_session(
    state: &AppState,
    conn: &Arc<WsConnection>,
    message: &WsMessage,
) -> anyhow::Result<()> {
    let session_id = active_session(conn)?;
    state
        .sessions
        .delete(&session_id)
        .await
        .map_err(|e| anyhow!("failed to delete session: {e}"))?;

    conn.set_session_id("");
    state.connections.rebind_session(conn, &session_id, "");

    conn.write_message(&WsMessage::success(message.id.clone())).await
}
