//! One live WebSocket connection and the registry that tracks them.
//!
//! The connection object owns the write half of the socket and the one-shot
//! close signal. Writes from the read pump, the heartbeat ticker, and
//! handler callbacks all funnel through a single critical section because
//! the transport does not tolerate concurrent writers. The read half stays
//! with the read pump; the connection only tracks its deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use parking_lot::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::protocol::WsMessage;

pub type MessageSink = Box<dyn Sink<Message, Error = axum::Error> + Send + Unpin>;

/// Generates a fresh connection identifier: 8 random bytes, hex-encoded.
pub fn generate_connection_id() -> String {
    let bytes: [u8; 8] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("conn-{hex}")
}

pub struct WsConnection {
    id: String,
    writer: tokio::sync::Mutex<MessageSink>,
    session_id: RwLock<String>,
    closed: AtomicBool,
    closer: CancellationToken,
    read_deadline: Mutex<Instant>,
    pong_wait: Duration,
    write_wait: Duration,
}

impl WsConnection {
    pub fn new(id: String, sink: MessageSink, pong_wait: Duration, write_wait: Duration) -> Self {
        Self {
            id,
            writer: tokio::sync::Mutex::new(sink),
            session_id: RwLock::new(String::new()),
            closed: AtomicBool::new(false),
            closer: CancellationToken::new(),
            read_deadline: Mutex::new(Instant::now() + pong_wait),
            pong_wait,
            write_wait,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    pub fn set_session_id(&self, session_id: &str) {
        *self.session_id.write() = session_id.to_string();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent: the first caller flips the closed flag and fires the
    /// close signal exactly once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closer.cancel();
        }
    }

    /// The close signal, observed by both pumps. Never owned by them.
    pub fn closed_signal(&self) -> CancellationToken {
        self.closer.clone()
    }

    /// Serializes and sends one message. This is the only write path into
    /// the socket; the internal lock makes it mutually exclusive across all
    /// producers. Bounded by the write deadline.
    pub async fn write_message(&self, message: &WsMessage) -> Result<()> {
        if self.is_closed() {
            bail!("connection {} is closed", self.id);
        }
        let text = serde_json::to_string(message)?;
        let mut writer = self.writer.lock().await;
        match timeout(self.write_wait, writer.send(Message::Text(text))).await {
            Ok(result) => result.map_err(|e| anyhow!("write failed: {e}")),
            Err(_) => Err(anyhow!("write to connection {} timed out", self.id)),
        }
    }

    /// Best-effort close handshake, used by the write pump on shutdown.
    pub async fn write_close_frame(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match timeout(self.write_wait, writer.send(Message::Close(None))).await {
            Ok(result) => result.map_err(|e| anyhow!("close frame failed: {e}")),
            Err(_) => Err(anyhow!("close frame to connection {} timed out", self.id)),
        }
    }

    /// Pushes the read deadline out by one pong-wait window. Called for
    /// every heartbeat response the read pump sees.
    pub fn extend_read_deadline(&self) {
        *self.read_deadline.lock() = Instant::now() + self.pong_wait;
    }

    pub fn read_deadline(&self) -> Instant {
        *self.read_deadline.lock()
    }

    pub fn pong_wait(&self) -> Duration {
        self.pong_wait
    }
}

#[derive(Default)]
struct ConnMaps {
    by_conn: HashMap<String, Arc<WsConnection>>,
    by_session: HashMap<String, Arc<WsConnection>>,
}

/// Registry of live connections, keyed by connection ID and, when bound, by
/// session ID. Both maps mutate under one lock so they cannot drift apart;
/// a session ID maps to at most one live connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    maps: RwLock<ConnMaps>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<WsConnection>) {
        let mut maps = self.maps.write();
        let session_id = conn.session_id();
        if !session_id.is_empty() {
            maps.by_session.insert(session_id, conn.clone());
        }
        maps.by_conn.insert(conn.id().to_string(), conn);
    }

    /// Idempotent: closes the connection and drops both of its mappings.
    pub fn remove(&self, conn_id: &str) {
        let mut maps = self.maps.write();
        if let Some(conn) = maps.by_conn.remove(conn_id) {
            let session_id = conn.session_id();
            if !session_id.is_empty() {
                maps.by_session.remove(&session_id);
            }
            conn.close();
        }
    }

    pub fn get(&self, conn_id: &str) -> Option<Arc<WsConnection>> {
        self.maps.read().by_conn.get(conn_id).cloned()
    }

    pub fn get_by_session(&self, session_id: &str) -> Option<Arc<WsConnection>> {
        self.maps.read().by_session.get(session_id).cloned()
    }

    /// Atomically moves a connection's session mapping from `old` to `new`.
    /// Either side may be empty.
    pub fn rebind_session(&self, conn: &Arc<WsConnection>, old: &str, new: &str) {
        let mut maps = self.maps.write();
        if !old.is_empty() {
            maps.by_session.remove(old);
        }
        if !new.is_empty() {
            maps.by_session.insert(new.to_string(), conn.clone());
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.maps.read().by_conn.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shutdown sweep: closes every connection and empties both maps.
    pub fn close_all(&self) {
        let mut maps = self.maps.write();
        for conn in maps.by_conn.values() {
            conn.close();
        }
        maps.by_conn.clear();
        maps.by_session.clear();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use futures::channel::mpsc;

    /// Builds a connection whose writes land in a channel the test can
    /// drain.
    pub(crate) fn channel_conn(
        id: &str,
        pong_wait: Duration,
    ) -> (Arc<WsConnection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded();
        let sink: MessageSink = Box::new(tx.sink_map_err(axum::Error::new));
        let conn = Arc::new(WsConnection::new(
            id.to_string(),
            sink,
            pong_wait,
            Duration::from_secs(10),
        ));
        (conn, rx)
    }

    /// Decodes one written frame as a [`WsMessage`].
    pub(crate) fn decode(message: &Message) -> WsMessage {
        match message {
            Message::Text(text) => serde_json::from_str(text).expect("valid envelope"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{channel_conn, decode};
    use super::*;
    use crate::protocol::MessageType;
    use futures_util::StreamExt;

    const PONG_WAIT: Duration = Duration::from_secs(60);

    #[test]
    fn connection_ids_are_prefixed_and_unique() {
        let a = generate_connection_id();
        let b = generate_connection_id();
        assert!(a.starts_with("conn-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn writes_reach_the_socket() {
        let (conn, mut rx) = channel_conn("conn-1", PONG_WAIT);
        conn.write_message(&WsMessage::pong("7")).await.unwrap();

        let frame = rx.next().await.unwrap();
        let message = decode(&frame);
        assert_eq!(message.kind, MessageType::Pong);
        assert_eq!(message.id, "7");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fires_the_signal_once() {
        let (conn, _rx) = channel_conn("conn-1", PONG_WAIT);
        let signal = conn.closed_signal();
        assert!(!signal.is_cancelled());

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let (conn, _rx) = channel_conn("conn-1", PONG_WAIT);
        conn.close();
        assert!(conn.write_message(&WsMessage::ping()).await.is_err());
    }

    #[tokio::test]
    async fn deadline_extension_moves_forward() {
        let (conn, _rx) = channel_conn("conn-1", PONG_WAIT);
        let before = conn.read_deadline();
        tokio::time::sleep(Duration::from_millis(5)).await;
        conn.extend_read_deadline();
        assert!(conn.read_deadline() > before);
    }

    #[tokio::test]
    async fn registry_remove_is_idempotent_and_closes() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = channel_conn("conn-1", PONG_WAIT);
        conn.set_session_id("sess-1");
        registry.add(conn.clone());

        assert!(registry.get("conn-1").is_some());
        assert!(registry.get_by_session("sess-1").is_some());

        registry.remove("conn-1");
        assert!(conn.is_closed());
        assert!(registry.get("conn-1").is_none());
        assert!(registry.get_by_session("sess-1").is_none());

        // Second remove is a no-op.
        registry.remove("conn-1");
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn rebind_leaves_only_the_new_mapping() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = channel_conn("conn-1", PONG_WAIT);
        conn.set_session_id("old");
        registry.add(conn.clone());

        conn.set_session_id("new");
        registry.rebind_session(&conn, "old", "new");

        assert!(registry.get_by_session("old").is_none());
        assert!(registry.get_by_session("new").is_some());

        // Clearing the binding removes the session mapping entirely.
        conn.set_session_id("");
        registry.rebind_session(&conn, "new", "");
        assert!(registry.get_by_session("new").is_none());
        assert!(registry.get("conn-1").is_some());
    }

    #[tokio::test]
    async fn close_all_closes_everything_and_empties_both_maps() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = channel_conn("conn-1", PONG_WAIT);
        let (second, _rx2) = channel_conn("conn-2", PONG_WAIT);
        second.set_session_id("sess-2");
        registry.add(first.clone());
        registry.add(second.clone());

        registry.close_all();
        assert!(first.is_closed());
        assert!(second.is_closed());
        assert!(registry.is_empty());
        assert!(registry.get_by_session("sess-2").is_none());
    }

    #[tokio::test]
    async fn list_snapshots_the_live_connection_ids() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = channel_conn("conn-1", PONG_WAIT);
        let (second, _rx2) = channel_conn("conn-2", PONG_WAIT);
        registry.add(first);
        registry.add(second);

        let mut ids = registry.list();
        ids.sort();
        assert_eq!(ids, vec!["conn-1".to_string(), "conn-2".to_string()]);
        assert_eq!(registry.len(), 2);
    }
}
