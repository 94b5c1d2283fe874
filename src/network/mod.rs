//! Network Layer
//!
//! Pairing protocol over WebSocket or single-shot HTTP.
//! Everything here is transport-agnostic except `server.rs`.

pub mod dispatcher;
pub mod heartbeat;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use dispatcher::{DispatchError, Dispatcher, Failure};
pub use heartbeat::{LivenessMonitor, SweepReport};
pub use protocol::{Command, ParseError, Reply};
pub use server::{AuthServer, ServerError};
pub use session::{Delivery, PendingReply, SessionError, SessionId, SessionInfo, SessionManager};
pub use transport::{
    ClientConnection, Connection, ConnectionId, HttpExchange, SocketLink, TransportKind,
};
