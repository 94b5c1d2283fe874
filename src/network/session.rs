//! Pairing Session Management
//!
//! Owns the lifecycle of pairing sessions: creation on connect, expiry,
//! switching a connection onto another session, and destruction.
//!
//! Each session is keyed by the connection id it is bound to, with a second
//! index by session id so a different connection (the other device) can
//! address it. Every mutation happens under one short lock that is never
//! held across an await, so each operation is atomic to observers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::network::protocol::Reply;
use crate::network::transport::{ClientConnection, ConnectionId};

/// Identifier used to address a session from another connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reply routed to a waiting request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Payload.
    pub reply: Reply,
    /// Destroy the session after sending.
    pub terminal: bool,
}

/// Single-slot continuation for the request awaiting a reply on a session.
///
/// Fulfilment consumes the slot, so it can happen at most once.
#[derive(Debug)]
pub struct PendingReply {
    tx: oneshot::Sender<Delivery>,
}

impl PendingReply {
    /// Create a slot and the receiver the requester waits on.
    pub fn channel() -> (Self, oneshot::Receiver<Delivery>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Hand the reply to the waiting request. Returns false if it went away.
    pub fn fulfill(self, delivery: Delivery) -> bool {
        self.tx.send(delivery).is_ok()
    }
}

/// A pairing session.
struct Session {
    session_id: SessionId,
    activated: bool,
    user_id: Option<String>,
    connection: Option<Arc<ClientConnection>>,
    pending: Option<PendingReply>,
    expiry: CancellationToken,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Bound connection id.
    pub connection_id: ConnectionId,
    /// Cross-device address.
    pub session_id: SessionId,
    /// Pairing confirmed by the secondary device.
    pub activated: bool,
    /// Linked user, once a credential was validated.
    pub user_id: Option<String>,
    /// A request is waiting for a reply.
    pub awaiting_reply: bool,
}

impl Session {
    fn info(&self, connection_id: &ConnectionId) -> SessionInfo {
        SessionInfo {
            connection_id: connection_id.clone(),
            session_id: self.session_id.clone(),
            activated: self.activated,
            user_id: self.user_id.clone(),
            awaiting_reply: self.pending.is_some(),
        }
    }
}

#[derive(Default)]
struct SessionTable {
    sessions: BTreeMap<ConnectionId, Session>,
    by_session_id: BTreeMap<SessionId, ConnectionId>,
}

impl SessionTable {
    /// Remove a session from both indices.
    fn remove(&mut self, id: &ConnectionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        self.by_session_id.remove(&session.session_id);
        session.expiry.cancel();
        Some(session)
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No live session for the identifier.
    #[error("Client not found")]
    NotFound,

    /// Pairing was already confirmed.
    #[error("Client already activated")]
    AlreadyActivated,

    /// Switch target does not exist.
    #[error("Failed to get session params for client {0}")]
    SwitchTargetMissing(ConnectionId),
}

/// In-memory registry of pairing sessions.
#[derive(Clone)]
pub struct SessionManager {
    table: Arc<Mutex<SessionTable>>,
    ttl: Duration,
}

impl SessionManager {
    /// Create a manager whose sessions expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(SessionTable::default())),
            ttl,
        }
    }

    /// Open a session for a newly accepted connection.
    ///
    /// Must be called inside a tokio runtime: the expiry timer is a task.
    pub fn create(&self, connection: Arc<ClientConnection>) -> SessionInfo {
        let expiry = CancellationToken::new();
        let info = {
            let mut table = self.table.lock();

            let mut connection_id = connection.id();
            while table.sessions.contains_key(&connection_id) {
                connection_id = ConnectionId::generate();
            }
            connection.rebind(connection_id.clone());

            let mut session_id = SessionId::generate();
            while table.by_session_id.contains_key(&session_id) {
                session_id = SessionId::generate();
            }

            let session = Session {
                session_id: session_id.clone(),
                activated: false,
                user_id: None,
                connection: Some(connection),
                pending: None,
                expiry: expiry.clone(),
            };
            let info = session.info(&connection_id);
            table.by_session_id.insert(session_id, connection_id.clone());
            table.sessions.insert(connection_id, session);
            info
        };

        spawn_expiry(Arc::downgrade(&self.table), info.connection_id.clone(), self.ttl, expiry);
        debug!(connection = %info.connection_id, session = %info.session_id, "session created");
        info
    }

    /// Look up by connection id.
    pub fn get(&self, id: &ConnectionId) -> Option<SessionInfo> {
        let table = self.table.lock();
        table.sessions.get(id).map(|s| s.info(id))
    }

    /// Look up by session id.
    pub fn find_by_session_id(&self, session_id: &str) -> Option<SessionInfo> {
        let table = self.table.lock();
        let connection_id = table
            .by_session_id
            .get(&SessionId(session_id.to_string()))?;
        table
            .sessions
            .get(connection_id)
            .map(|s| s.info(connection_id))
    }

    /// Rebind `connection` to the session bound to `target`.
    ///
    /// The connection's pending reply moves onto the target, the donor session
    /// is destroyed without closing the connection, and the target's stored
    /// connection becomes `connection`.
    pub fn switch(
        &self,
        connection: &Arc<ClientConnection>,
        target: &ConnectionId,
    ) -> Result<(), SessionError> {
        let donor_id = connection.id();
        if &donor_id == target {
            return Ok(());
        }

        let replaced = {
            let mut table = self.table.lock();
            if !table.sessions.contains_key(target) {
                return Err(SessionError::SwitchTargetMissing(target.clone()));
            }

            let pending = table.remove(&donor_id).and_then(|mut donor| {
                donor.connection = None;
                donor.pending.take()
            });

            let Some(session) = table.sessions.get_mut(target) else {
                return Err(SessionError::SwitchTargetMissing(target.clone()));
            };
            if pending.is_some() {
                session.pending = pending;
            }
            connection.rebind(target.clone());
            session.connection.replace(connection.clone())
        };

        if let Some(previous) = replaced {
            if !previous.same_link(connection) {
                previous.close();
            }
        }
        info!(from = %donor_id, to = %target, "connection switched sessions");
        Ok(())
    }

    /// Close the session's connection and remove it. No-op if already gone.
    pub fn finalize(&self, id: &ConnectionId) {
        finalize_in(&self.table, id);
    }

    /// Link a validated user to a session.
    pub fn link_user(&self, id: &ConnectionId, user_id: String) -> Result<(), SessionError> {
        let mut table = self.table.lock();
        let session = table.sessions.get_mut(id).ok_or(SessionError::NotFound)?;
        session.user_id = Some(user_id);
        Ok(())
    }

    /// Mark the session addressed by `session_id` as activated.
    pub fn activate(&self, session_id: &str) -> Result<SessionInfo, SessionError> {
        let mut table = self.table.lock();
        let connection_id = table
            .by_session_id
            .get(&SessionId(session_id.to_string()))
            .cloned()
            .ok_or(SessionError::NotFound)?;
        let session = table
            .sessions
            .get_mut(&connection_id)
            .ok_or(SessionError::NotFound)?;
        if session.activated {
            return Err(SessionError::AlreadyActivated);
        }
        session.activated = true;
        Ok(session.info(&connection_id))
    }

    /// Park a request on the session until a reply is routed to it.
    pub fn await_reply(&self, id: &ConnectionId, slot: PendingReply) -> Result<(), SessionError> {
        let mut table = self.table.lock();
        let session = table.sessions.get_mut(id).ok_or(SessionError::NotFound)?;
        if session.pending.replace(slot).is_some() {
            warn!(connection = %id, "request arrived while another was pending; previous dropped");
        }
        Ok(())
    }

    /// Take the session's pending reply slot, if any.
    pub fn take_reply(&self, id: &ConnectionId) -> Option<PendingReply> {
        let mut table = self.table.lock();
        table.sessions.get_mut(id)?.pending.take()
    }

    /// The connection a session currently owns.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let table = self.table.lock();
        table.sessions.get(id)?.connection.clone()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.table.lock().sessions.len()
    }

    /// No live sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live sessions.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let table = self.table.lock();
        table.sessions.iter().map(|(id, s)| s.info(id)).collect()
    }

    /// Destroy every session.
    pub fn clear(&self) {
        let ids: Vec<ConnectionId> = self.table.lock().sessions.keys().cloned().collect();
        for id in ids {
            self.finalize(&id);
        }
    }
}

fn finalize_in(table: &Mutex<SessionTable>, id: &ConnectionId) {
    let removed = table.lock().remove(id);
    if let Some(session) = removed {
        debug!(connection = %id, session = %session.session_id, "session finalized");
        if let Some(connection) = session.connection {
            connection.close();
        }
    }
}

fn spawn_expiry(
    table: Weak<Mutex<SessionTable>>,
    id: ConnectionId,
    ttl: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(ttl) => {
                if let Some(table) = table.upgrade() {
                    debug!(connection = %id, "session expired");
                    finalize_in(&table, &id);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::{Connection, HttpExchange, SocketLink};
    use proptest::prelude::*;

    const TTL: Duration = Duration::from_secs(300);

    fn socket_client() -> Arc<ClientConnection> {
        let (link, _rx) = SocketLink::new();
        Arc::new(ClientConnection::new(Arc::new(link)))
    }

    fn http_client() -> (Arc<ClientConnection>, Arc<HttpExchange>, oneshot::Receiver<String>) {
        let (exchange, rx) = HttpExchange::new();
        let exchange = Arc::new(exchange);
        let link: Arc<dyn Connection> = exchange.clone();
        (Arc::new(ClientConnection::new(link)), exchange, rx)
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let manager = SessionManager::new(TTL);
        let client = socket_client();
        let info = manager.create(client.clone());

        assert_eq!(info.connection_id, client.id());
        assert!(!info.activated);
        assert!(info.user_id.is_none());
        assert_eq!(manager.get(&client.id()), Some(info.clone()));
        assert_eq!(manager.find_by_session_id(info.session_id.as_str()), Some(info));
        assert!(manager.find_by_session_id("missing").is_none());
    }

    #[tokio::test]
    async fn test_activate_once() {
        let manager = SessionManager::new(TTL);
        let info = manager.create(socket_client());

        assert!(manager.activate(info.session_id.as_str()).unwrap().activated);
        assert_eq!(
            manager.activate(info.session_id.as_str()),
            Err(SessionError::AlreadyActivated)
        );
        assert_eq!(manager.activate("nope"), Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_finalize_closes_and_is_idempotent() {
        let manager = SessionManager::new(TTL);
        let (link, _rx) = SocketLink::new();
        let link = Arc::new(link);
        let dyn_link: Arc<dyn Connection> = link.clone();
        let client = Arc::new(ClientConnection::new(dyn_link));
        let info = manager.create(client.clone());

        manager.finalize(&client.id());
        assert!(link.is_terminated());
        assert!(manager.get(&client.id()).is_none());
        assert!(manager.find_by_session_id(info.session_id.as_str()).is_none());

        manager.finalize(&client.id());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_pending_reply_slot() {
        let manager = SessionManager::new(TTL);
        let client = socket_client();
        manager.create(client.clone());

        let (slot, rx) = PendingReply::channel();
        manager.await_reply(&client.id(), slot).unwrap();
        assert!(manager.get(&client.id()).unwrap().awaiting_reply);

        let slot = manager.take_reply(&client.id()).unwrap();
        assert!(manager.take_reply(&client.id()).is_none());
        assert!(slot.fulfill(Delivery {
            reply: Reply::error("x"),
            terminal: true,
        }));
        assert!(rx.await.unwrap().terminal);
    }

    #[tokio::test]
    async fn test_await_reply_on_missing_session() {
        let manager = SessionManager::new(TTL);
        let (slot, _rx) = PendingReply::channel();
        assert_eq!(
            manager.await_reply(&ConnectionId::from("ghost"), slot),
            Err(SessionError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_switch_moves_pending_and_destroys_donor() {
        let manager = SessionManager::new(TTL);
        let (conn_a, exchange_a, _rx_a) = http_client();
        let (conn_b, exchange_b, _rx_b) = http_client();
        let s1 = manager.create(conn_a.clone());
        let s2 = manager.create(conn_b.clone());

        let (slot, mut reply_rx) = PendingReply::channel();
        manager.await_reply(&conn_a.id(), slot).unwrap();

        manager.switch(&conn_a, &s2.connection_id).unwrap();

        // s1 unreachable by either id
        assert!(manager.get(&s1.connection_id).is_none());
        assert!(manager.find_by_session_id(s1.session_id.as_str()).is_none());
        // A's connection was not closed by the donor's destruction
        assert!(!exchange_a.is_finished());
        // s2 now reachable through A's physical connection
        assert_eq!(conn_a.id(), s2.connection_id);
        let owner = manager.connection(&s2.connection_id).unwrap();
        assert!(owner.same_link(&conn_a));
        // B's old exchange closed when replaced
        assert!(exchange_b.is_finished());
        // A's pending continuation now answers in s2's context
        let slot = manager.take_reply(&s2.connection_id).unwrap();
        slot.fulfill(Delivery {
            reply: Reply::error("answered"),
            terminal: false,
        });
        assert_eq!(reply_rx.try_recv().unwrap().reply, Reply::error("answered"));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_switch_to_missing_target_fails() {
        let manager = SessionManager::new(TTL);
        let (conn, _exchange, _rx) = http_client();
        let info = manager.create(conn.clone());

        let result = manager.switch(&conn, &ConnectionId::from("missing"));
        assert_eq!(
            result,
            Err(SessionError::SwitchTargetMissing(ConnectionId::from("missing")))
        );
        assert_eq!(manager.get(&info.connection_id), Some(info));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_finalizes() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let (conn, exchange, rx) = http_client();
        let info = manager.create(conn);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(manager.find_by_session_id(info.session_id.as_str()).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.find_by_session_id(info.session_id.as_str()).is_none());
        assert!(exchange.is_finished());
        assert_eq!(rx.await.unwrap(), "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_switched_donor_timer_cancelled() {
        let manager = SessionManager::new(Duration::from_secs(60));
        let (conn_a, _ea, _ra) = http_client();
        let (conn_b, _eb, _rb) = http_client();
        let s1 = manager.create(conn_a.clone());
        tokio::time::sleep(Duration::from_secs(30)).await;
        let s2 = manager.create(conn_b);

        manager.switch(&conn_a, &s2.connection_id).unwrap();
        // Donor's timer would have fired at t=60 and must not touch s2
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(manager.get(&s1.connection_id).is_none());
        assert!(manager.find_by_session_id(s2.session_id.as_str()).is_some());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(manager.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create,
        Switch(usize, usize),
        Finalize(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Create),
            (0usize..16, 0usize..16).prop_map(|(a, b)| Op::Switch(a, b)),
            (0usize..16).prop_map(Op::Finalize),
        ]
    }

    proptest! {
        #[test]
        fn prop_ids_unique_among_live_sessions(
            ops in proptest::collection::vec(op_strategy(), 1..48),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            runtime.block_on(async {
                let manager = SessionManager::new(TTL);
                let mut clients: Vec<Arc<ClientConnection>> = Vec::new();
                for op in ops {
                    match op {
                        Op::Create => {
                            let (conn, _exchange, _rx) = http_client();
                            manager.create(conn.clone());
                            clients.push(conn);
                        }
                        Op::Switch(a, b) if !clients.is_empty() => {
                            let a = &clients[a % clients.len()];
                            let target = clients[b % clients.len()].id();
                            let _ = manager.switch(a, &target);
                        }
                        Op::Finalize(i) if !clients.is_empty() => {
                            manager.finalize(&clients[i % clients.len()].id());
                        }
                        _ => {}
                    }

                    let live = manager.snapshot();
                    let mut connection_ids: Vec<_> =
                        live.iter().map(|s| s.connection_id.clone()).collect();
                    let mut session_ids: Vec<_> =
                        live.iter().map(|s| s.session_id.clone()).collect();
                    connection_ids.sort();
                    connection_ids.dedup();
                    session_ids.sort();
                    session_ids.dedup();
                    assert_eq!(connection_ids.len(), live.len());
                    assert_eq!(session_ids.len(), live.len());
                    for info in &live {
                        assert_eq!(
                            manager
                                .find_by_session_id(info.session_id.as_str())
                                .map(|s| s.connection_id),
                            Some(info.connection_id.clone())
                        );
                    }
                }
            });
        }
    }
}
