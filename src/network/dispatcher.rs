//! Command Dispatcher
//!
//! Parses inbound envelopes and runs the pairing protocol. Every request parks
//! a [`PendingReply`] on its session before dispatch; handlers answer through
//! [`Dispatcher::resolve`], which either fulfils that slot or, for a session
//! nobody is waiting on, pushes straight onto its socket.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, CapabilityError};
use crate::config::{ResolvedConfig, TransportMode};
use crate::network::protocol::{
    ActivationReply, BiometricRequest, CheckReply, CheckRequest, Command, InitReply, InitRequest,
    ParseError, Reply, StatusReply, StatusRequest, TokenPush, VerificationReply,
};
use crate::network::session::{Delivery, PendingReply, SessionError, SessionManager};
use crate::network::transport::{ClientConnection, Connection, ConnectionId, TransportKind};
use crate::token::{TokenCodec, TokenError};

/// Protocol failures. The display string is the message sent to clients.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Payload is not a valid envelope.
    #[error("Wrong data received {0}")]
    Malformed(String),

    /// Missing or unrecognized command.
    #[error("Unknown command {0}")]
    UnknownCommand(String),

    /// STATUS credential or status lookup failed.
    #[error("Failed to validate user. Received token: {0}")]
    StatusFailed(String),

    /// ENABLE credential validation failed.
    #[error("Failed to identify user with token: {0}")]
    IdentifyFailed(String),

    /// Session lookup or state failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// BIO_ENABLE on a session without a linked user.
    #[error("User id is not assigned.")]
    UserNotAssigned,

    /// BIO_AUTH on a session that already has a user.
    #[error("Client has wrong parameters.")]
    WrongParameters,

    /// Biometric id is not a hyphenated UUID.
    #[error("Bad biometric id.")]
    BadBiometricId,

    /// Activation or lookup capability failed.
    #[error("Biometric service failed: {0}")]
    Biometric(CapabilityError),

    /// Token could not be built.
    #[error("Failed to issue token")]
    Token(#[from] TokenError),
}

impl DispatchError {
    /// Also notify the cross-device session bound to `peer`.
    pub fn with_peer(self, peer: ConnectionId) -> Failure {
        Failure {
            error: self,
            peer: Some(peer),
        }
    }
}

/// A terminal failure and the parties to tell about it.
#[derive(Debug)]
pub struct Failure {
    /// What went wrong.
    pub error: DispatchError,
    /// Cross-device session that also receives the error.
    pub peer: Option<ConnectionId>,
}

impl From<DispatchError> for Failure {
    fn from(error: DispatchError) -> Self {
        Self { error, peer: None }
    }
}

impl From<SessionError> for Failure {
    fn from(error: SessionError) -> Self {
        DispatchError::from(error).into()
    }
}

/// ENABLE and AUTH share one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitFlow {
    Enable,
    Auth,
}

impl InitFlow {
    fn name(self) -> &'static str {
        match self {
            InitFlow::Enable => "ENABLE",
            InitFlow::Auth => "AUTH",
        }
    }

    fn reply(self, body: InitReply) -> Reply {
        match self {
            InitFlow::Enable => Reply::Enable(body),
            InitFlow::Auth => Reply::Auth(body),
        }
    }
}

/// Biometric ids are hyphenated UUIDs.
fn is_valid_bio_id(bio_id: &str) -> bool {
    bio_id.len() == 36 && Uuid::try_parse(bio_id).is_ok()
}

/// Protocol state machine over the session store.
pub struct Dispatcher {
    sessions: SessionManager,
    codec: TokenCodec,
    backend: Backend,
    project_id: String,
    callback_url: String,
    kind: TransportKind,
}

impl Dispatcher {
    /// Create a dispatcher for a validated configuration.
    pub fn new(config: &ResolvedConfig, sessions: SessionManager, backend: Backend) -> Self {
        let kind = match config.transport {
            TransportMode::Http => TransportKind::SingleShot,
            TransportMode::Socket { .. } => TransportKind::Persistent,
        };
        Self {
            sessions,
            codec: TokenCodec::new(&config.secret),
            backend,
            project_id: config.project_id.clone(),
            callback_url: config.callback_url.clone(),
            kind,
        }
    }

    /// Session store.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Transport kind this dispatcher serves.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Accept a new physical connection and open its session.
    pub fn open(&self, link: Arc<dyn Connection>) -> Arc<ClientConnection> {
        let client = Arc::new(ClientConnection::new(link));
        self.sessions.create(client.clone());
        client
    }

    /// Run one request/response cycle for `raw` received on `client`.
    ///
    /// Returns once the reply has been written, or once the session is gone.
    pub async fn handle(&self, client: &Arc<ClientConnection>, raw: &str) {
        let (slot, reply_rx) = PendingReply::channel();
        if let Err(e) = self.sessions.await_reply(&client.id(), slot) {
            warn!(connection = %client.id(), "message for closed session");
            client.send_reply(&Reply::error(e.to_string()));
            client.close();
            return;
        }

        if let Err(failure) = self.dispatch(client, raw).await {
            self.fail(client, failure);
        }

        match reply_rx.await {
            Ok(delivery) => {
                client.send_reply(&delivery.reply);
                if delivery.terminal {
                    // Identity may have changed through a switch
                    self.sessions.finalize(&client.id());
                }
            }
            Err(_) => debug!(connection = %client.id(), "session ended before reply"),
        }
    }

    async fn dispatch(&self, client: &Arc<ClientConnection>, raw: &str) -> Result<(), Failure> {
        let command = Command::parse(raw).map_err(|e| match e {
            ParseError::Malformed => DispatchError::Malformed(raw.to_string()),
            ParseError::Unknown(name) => DispatchError::UnknownCommand(name),
        })?;
        debug!(connection = %client.id(), command = command.name(), "dispatch");

        match command {
            Command::Status(req) => self.respond_status(client, req).await,
            Command::Enable(req) => self.respond_init(client, req, InitFlow::Enable).await,
            Command::Auth(req) => self.respond_init(client, req, InitFlow::Auth).await,
            Command::Check(req) => self.respond_check(client, req),
            Command::BioEnable(req) => self.respond_bio_enable(client, req).await,
            Command::BioAuth(req) => self.respond_bio_auth(client, req).await,
        }
    }

    async fn respond_status(
        &self,
        client: &Arc<ClientConnection>,
        req: StatusRequest,
    ) -> Result<(), Failure> {
        let failed = |e: CapabilityError| {
            debug!(error = %e, "status lookup failed");
            DispatchError::StatusFailed(req.user_data.clone())
        };
        let user_id = self.backend.validator.validate(&req.user_data).await.map_err(failed)?;
        let is_active = self.backend.status.is_active(&user_id).await.map_err(failed)?;

        let reply = Reply::Status(StatusReply {
            check: true,
            is_active,
        });
        self.resolve(&client.id(), reply, true);
        Ok(())
    }

    async fn respond_init(
        &self,
        client: &Arc<ClientConnection>,
        req: InitRequest,
        flow: InitFlow,
    ) -> Result<(), Failure> {
        if self.kind == TransportKind::SingleShot {
            if let Some(target) = req.connection_id {
                // Parked until a cross-device reply or expiry
                self.sessions.switch(client, &ConnectionId::from(target))?;
                return Ok(());
            }
        }

        if flow == InitFlow::Enable {
            let user_id = self
                .backend
                .validator
                .validate(&req.user_data)
                .await
                .map_err(|e| {
                    debug!(error = %e, "credential rejected");
                    DispatchError::IdentifyFailed(req.user_data.clone())
                })?;
            self.sessions.link_user(&client.id(), user_id)?;
        }

        let connection_id = client.id();
        let session = self.sessions.get(&connection_id).ok_or(SessionError::NotFound)?;
        let token = self
            .codec
            .seal(session.session_id.as_str(), &self.callback_url, flow.name())
            .map_err(DispatchError::from)?;

        let reply = flow.reply(InitReply {
            token,
            id: self.project_id.clone(),
            connection_id: (self.kind == TransportKind::SingleShot)
                .then(|| connection_id.to_string()),
        });
        self.resolve(&connection_id, reply, false);
        Ok(())
    }

    fn respond_check(
        &self,
        client: &Arc<ClientConnection>,
        req: CheckRequest,
    ) -> Result<(), Failure> {
        let session = self.sessions.activate(&req.session_id)?;
        info!(session = %session.session_id, by = %client.id(), "pairing confirmed");
        self.resolve(&client.id(), Reply::Check(CheckReply { ready: true }), false);
        Ok(())
    }

    async fn respond_bio_enable(
        &self,
        client: &Arc<ClientConnection>,
        req: BiometricRequest,
    ) -> Result<(), Failure> {
        let session = self
            .sessions
            .find_by_session_id(&req.session_id)
            .ok_or(SessionError::NotFound)?;
        let peer = session.connection_id;

        let Some(user_id) = session.user_id else {
            return Err(DispatchError::UserNotAssigned.with_peer(peer));
        };
        if !is_valid_bio_id(&req.bio_id) {
            return Err(DispatchError::BadBiometricId.with_peer(peer));
        }

        let is_active = match self.backend.activator.activate(&user_id, &req.bio_id).await {
            Ok(is_active) => is_active,
            Err(e) => return Err(DispatchError::Biometric(e).with_peer(peer)),
        };
        info!(user = %user_id, is_active, "biometric enrolment");

        let reply = Reply::BioEnable(ActivationReply { is_active });
        let requester = client.id();
        if peer != requester {
            self.resolve(&peer, reply.clone(), true);
        }
        self.resolve(&requester, reply, true);
        Ok(())
    }

    async fn respond_bio_auth(
        &self,
        client: &Arc<ClientConnection>,
        req: BiometricRequest,
    ) -> Result<(), Failure> {
        let session = self
            .sessions
            .find_by_session_id(&req.session_id)
            .ok_or(SessionError::NotFound)?;
        let peer = session.connection_id;

        if session.user_id.is_some() {
            return Err(DispatchError::WrongParameters.with_peer(peer));
        }
        if !is_valid_bio_id(&req.bio_id) {
            return Err(DispatchError::BadBiometricId.with_peer(peer));
        }

        let token = match self.backend.lookup.token_for(&req.bio_id).await {
            Ok(token) => token,
            Err(e) => return Err(DispatchError::Biometric(e).with_peer(peer)),
        };
        info!(session = %session.session_id, found = token.is_some(), "biometric verification");

        let requester = client.id();
        let result = Reply::BioAuth(VerificationReply {
            result: token.is_some(),
        });
        self.resolve(&requester, result, true);
        if peer != requester {
            self.resolve(&peer, Reply::Token(TokenPush { token }), true);
        }
        Ok(())
    }

    /// Route a reply to the session bound to `id`.
    pub fn resolve(&self, id: &ConnectionId, reply: Reply, terminal: bool) {
        if let Some(slot) = self.sessions.take_reply(id) {
            if slot.fulfill(Delivery { reply, terminal }) {
                return;
            }
            debug!(connection = %id, "pending request went away");
            if terminal {
                self.sessions.finalize(id);
            }
            return;
        }

        if self.kind == TransportKind::Persistent {
            if let Some(connection) = self.sessions.connection(id) {
                connection.send_reply(&reply);
                if terminal {
                    self.sessions.finalize(id);
                }
                return;
            }
        }
        debug!(connection = %id, "no one to deliver reply to");
    }

    /// Send the error to every affected party and end their sessions.
    fn fail(&self, client: &Arc<ClientConnection>, failure: Failure) {
        let requester = client.id();
        warn!(connection = %requester, error = %failure.error, "request failed");

        let message = failure.error.to_string();
        if let Some(peer) = failure.peer.filter(|p| *p != requester) {
            self.resolve(&peer, Reply::error(message.clone()), true);
        }
        self.resolve(&requester, Reply::error(message), true);
    }
}
