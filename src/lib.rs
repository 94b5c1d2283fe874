//! # Enface Auth Server
//!
//! Cross-device pairing and biometric authentication handshake.
//!
//! A primary device (browser, server client) opens a session and receives an
//! encrypted token. A secondary device (mobile app) presents that token's
//! session id to confirm pairing, then enrols or verifies a biometric id. The
//! result is pushed back to the primary device.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ENFACE AUTH SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  config.rs       - Settings, constants, validation           │
//! │  token.rs        - Deterministic keyed token codec           │
//! │                                                              │
//! │  backend/        - Injected capabilities                     │
//! │  ├── jwt.rs      - JWT credential validation                 │
//! │  └── memory.rs   - In-memory capability store                │
//! │                                                              │
//! │  network/        - Protocol and transports                   │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── transport.rs- Single-shot / persistent connections      │
//! │  ├── session.rs  - Pairing session store                     │
//! │  ├── dispatcher.rs - Protocol state machine                  │
//! │  ├── heartbeat.rs- Socket liveness sweep                     │
//! │  └── server.rs   - WebSocket server / HTTP route             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session Lifetime
//!
//! Sessions live in memory only. Each one is destroyed by whichever comes
//! first: a terminal reply, a switch onto another session, a disconnect, or
//! the [`AUTHORIZATION_TIME_FRAME`] expiry.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod network;
pub mod token;

// Re-export commonly used types
pub use backend::{Backend, CapabilityError, JwtConfig, JwtValidator, MemoryBackend};
pub use config::{AuthConfig, ConfigError, AUTHORIZATION_TIME_FRAME, HEARTBEAT_INTERVAL, HTTP_URI};
pub use network::{AuthServer, Reply, ServerError, SessionManager};
pub use token::{TokenCodec, TokenError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
