//! Transport Adapter
//!
//! Normalizes the two transport kinds behind one outbound surface:
//!
//! - **Single-shot** (`HttpExchange`): one HTTP request, one response body.
//!   `send` ends the exchange with the payload; `close` ends it with the
//!   `timeout` sentinel if nothing was sent yet.
//! - **Persistent** (`SocketLink`): a WebSocket. `send` pushes a text frame;
//!   `close` terminates the socket.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::network::protocol::Reply;

/// Body sent when a single-shot exchange is closed without a reply.
pub const CLOSE_SENTINEL: &str = "timeout";

/// Identifier of the connection a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport kind, fixed at server construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// One request, one response.
    SingleShot,
    /// Long-lived duplex socket.
    Persistent,
}

/// Outbound half of one physical connection.
pub trait Connection: Send + Sync {
    /// Transport kind of this connection.
    fn kind(&self) -> TransportKind;
    /// Deliver a serialized payload.
    fn send(&self, payload: String);
    /// End the connection. Never fails; errors are logged and swallowed.
    fn close(&self);
}

/// A physical connection together with the session identity it represents.
///
/// The identity can be rebound when the connection switches sessions.
pub struct ClientConnection {
    id: Mutex<ConnectionId>,
    link: Arc<dyn Connection>,
}

impl ClientConnection {
    /// Wrap a link under a fresh connection id.
    pub fn new(link: Arc<dyn Connection>) -> Self {
        Self {
            id: Mutex::new(ConnectionId::generate()),
            link,
        }
    }

    /// Current connection id.
    pub fn id(&self) -> ConnectionId {
        self.id.lock().clone()
    }

    /// Represent a different session from now on.
    pub fn rebind(&self, id: ConnectionId) {
        *self.id.lock() = id;
    }

    /// Transport kind.
    pub fn kind(&self) -> TransportKind {
        self.link.kind()
    }

    /// Serialize and send a reply.
    pub fn send_reply(&self, reply: &Reply) {
        match reply.to_json() {
            Ok(json) => {
                debug!(connection = %self.id(), payload = %json, "send");
                self.link.send(json);
            }
            Err(e) => error!("Failed to serialize reply: {}", e),
        }
    }

    /// Close the underlying connection.
    pub fn close(&self) {
        debug!(connection = %self.id(), "close");
        self.link.close();
    }

    /// Same physical connection.
    pub fn same_link(&self, other: &ClientConnection) -> bool {
        Arc::ptr_eq(&self.link, &other.link)
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

// =============================================================================
// SINGLE-SHOT
// =============================================================================

/// One HTTP request/response exchange.
pub struct HttpExchange {
    body: Mutex<Option<oneshot::Sender<String>>>,
}

impl HttpExchange {
    /// Create an exchange and the receiver the HTTP handler answers from.
    pub fn new() -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                body: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Whether the response has been written.
    pub fn is_finished(&self) -> bool {
        self.body.lock().is_none()
    }

    fn finish(&self, body: String) -> bool {
        match self.body.lock().take() {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }
}

impl Connection for HttpExchange {
    fn kind(&self) -> TransportKind {
        TransportKind::SingleShot
    }

    fn send(&self, payload: String) {
        if !self.finish(payload) {
            debug!("HTTP exchange already finished, reply dropped");
        }
    }

    fn close(&self) {
        if !self.finish(CLOSE_SENTINEL.to_string()) {
            debug!("HTTP exchange already finished");
        }
    }
}

// =============================================================================
// PERSISTENT
// =============================================================================

/// Frames queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame.
    Text(String),
    /// Heartbeat probe.
    Ping,
}

static NEXT_LINK_KEY: AtomicU64 = AtomicU64::new(1);

/// One WebSocket connection.
pub struct SocketLink {
    key: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    alive: AtomicBool,
    terminated: CancellationToken,
}

impl SocketLink {
    /// Create a link and the receiver its writer task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                key: NEXT_LINK_KEY.fetch_add(1, Ordering::Relaxed),
                tx,
                alive: AtomicBool::new(true),
                terminated: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Registry key.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Fires when the link is terminated.
    pub fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }

    /// Whether the link has been terminated.
    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Heartbeat reply received.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Whether a heartbeat reply arrived since the last probe.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Flag not-alive and send a heartbeat probe.
    pub fn probe(&self) {
        self.alive.store(false, Ordering::Relaxed);
        if self.tx.send(Outbound::Ping).is_err() {
            debug!(link = self.key, "probe on closed socket");
        }
    }
}

impl Connection for SocketLink {
    fn kind(&self) -> TransportKind {
        TransportKind::Persistent
    }

    fn send(&self, payload: String) {
        if self.is_terminated() || self.tx.send(Outbound::Text(payload)).is_err() {
            debug!(link = self.key, "send on closed socket");
        }
    }

    fn close(&self) {
        self.terminated.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_send_then_close_keeps_body() {
        let (exchange, rx) = HttpExchange::new();
        exchange.send("{\"ok\":true}".into());
        exchange.close();
        assert!(exchange.is_finished());
        assert_eq!(rx.await.unwrap(), "{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_http_close_sends_sentinel() {
        let (exchange, rx) = HttpExchange::new();
        exchange.close();
        assert_eq!(rx.await.unwrap(), CLOSE_SENTINEL);
    }

    #[test]
    fn test_http_close_after_receiver_dropped() {
        let (exchange, rx) = HttpExchange::new();
        drop(rx);
        // Swallowed
        exchange.close();
        exchange.send("late".into());
    }

    #[tokio::test]
    async fn test_socket_send_queues_text() {
        let (link, mut rx) = SocketLink::new();
        link.send("hello".into());
        assert_eq!(rx.recv().await, Some(Outbound::Text("hello".into())));
    }

    #[test]
    fn test_socket_close_terminates() {
        let (link, mut rx) = SocketLink::new();
        link.close();
        assert!(link.is_terminated());
        link.send("dropped".into());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_socket_probe_flags_not_alive() {
        let (link, mut rx) = SocketLink::new();
        assert!(link.is_alive());
        link.probe();
        assert!(!link.is_alive());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);
        link.mark_alive();
        assert!(link.is_alive());
    }

    #[test]
    fn test_link_keys_unique() {
        let (a, _ra) = SocketLink::new();
        let (b, _rb) = SocketLink::new();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_client_rebind() {
        let (link, _rx) = SocketLink::new();
        let client = ClientConnection::new(Arc::new(link));
        let before = client.id();
        client.rebind(ConnectionId::from("target"));
        assert_ne!(client.id(), before);
        assert_eq!(client.id().as_str(), "target");
        assert_eq!(client.kind(), TransportKind::Persistent);
    }
}
