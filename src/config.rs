//! Server Configuration
//!
//! Construction-time settings for the pairing server. Exactly one transport
//! must be chosen: a host-owned HTTP router (single-shot mode) or a listen
//! port for the WebSocket server (persistent mode).

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use axum::Router;
use base64::Engine;
use thiserror::Error;

/// How long a session may live before it is finalized unconditionally.
pub const AUTHORIZATION_TIME_FRAME: Duration = Duration::from_secs(5 * 60);

/// Interval between liveness sweeps on the persistent transport.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Route mounted on the host router in single-shot mode. Also appended to
/// the callback URL embedded in tokens.
pub const HTTP_URI: &str = "/enface";

/// Pairing server configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Identifier returned to clients for display/verification.
    pub project_id: String,
    /// Shared token secret, base64 encoded.
    pub secret_code: String,
    /// Base address embedded in tokens.
    pub callback_url: String,
    /// Host router to mount the single-shot route on (HTTP mode).
    pub http_server: Option<Router>,
    /// Listen port for the WebSocket server (socket mode).
    pub port: Option<u16>,
    /// Bind address for socket mode.
    pub bind_host: IpAddr,
    /// Verbose diagnostics. Has no behavioural effect.
    pub debug: bool,
    /// Session expiry window.
    pub session_ttl: Duration,
    /// Liveness sweep interval (socket mode only).
    pub heartbeat_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            secret_code: String::new(),
            callback_url: String::new(),
            http_server: None,
            port: None,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            debug: false,
            session_ttl: AUTHORIZATION_TIME_FRAME,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

impl AuthConfig {
    /// Create config from environment variables.
    ///
    /// Only the socket transport can be selected here; HTTP mode needs a
    /// router and is wired up by the host.
    pub fn from_env() -> Self {
        Self {
            project_id: std::env::var("ENFACE_PROJECT_ID").unwrap_or_default(),
            secret_code: std::env::var("ENFACE_SECRET_CODE").unwrap_or_default(),
            callback_url: std::env::var("ENFACE_CALLBACK_URL").unwrap_or_default(),
            port: std::env::var("ENFACE_PORT").ok().and_then(|v| v.parse().ok()),
            debug: std::env::var("ENFACE_DEBUG")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            ..Default::default()
        }
    }

    /// Validate the configuration and derive the values the server runs on.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let transport = match (self.http_server.is_some(), self.port) {
            (true, Some(_)) => return Err(ConfigError::ConflictingTransports),
            (false, None) => return Err(ConfigError::MissingTransport),
            (true, None) => TransportMode::Http,
            (false, Some(port)) => TransportMode::Socket { port },
        };

        if self.project_id.is_empty() {
            return Err(ConfigError::Missing("projectId"));
        }
        if self.callback_url.is_empty() {
            return Err(ConfigError::Missing("callbackUrl"));
        }

        let secret = base64::engine::general_purpose::STANDARD
            .decode(self.secret_code.trim())
            .map_err(|e| ConfigError::InvalidSecret(e.to_string()))?;
        if secret.is_empty() {
            return Err(ConfigError::Missing("secretCode"));
        }

        let mut callback_url = self
            .callback_url
            .strip_suffix('/')
            .unwrap_or(&self.callback_url)
            .to_string();
        if transport == TransportMode::Http {
            callback_url.push_str(HTTP_URI);
        }

        Ok(ResolvedConfig {
            project_id: self.project_id.clone(),
            secret,
            callback_url,
            transport,
        })
    }
}

/// Selected transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Single-shot HTTP exchanges on a host router.
    Http,
    /// Persistent WebSocket connections on our own listener.
    Socket {
        /// Listen port.
        port: u16,
    },
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Project identifier.
    pub project_id: String,
    /// Decoded token secret.
    pub secret: Vec<u8>,
    /// Normalized callback URL.
    pub callback_url: String,
    /// Selected transport.
    pub transport: TransportMode,
}

/// Configuration errors. All of them abort construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Both an HTTP router and a port were supplied.
    #[error("specify either an HTTP server for http(s) mode or a port for ws(s) mode, not both")]
    ConflictingTransports,
    /// Neither an HTTP router nor a port was supplied.
    #[error("no transport configured: supply an HTTP server or a port")]
    MissingTransport,
    /// Required field is empty.
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    /// Secret is not valid base64.
    #[error("secret code is not valid base64: {0}")]
    InvalidSecret(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AuthConfig {
        AuthConfig {
            project_id: "project-1".into(),
            secret_code: "c2VjcmV0LWtleQ==".into(),
            callback_url: "https://auth.example.com/".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_both_transports_rejected() {
        let config = AuthConfig {
            http_server: Some(Router::new()),
            port: Some(9000),
            ..base_config()
        };
        assert!(matches!(config.resolve(), Err(ConfigError::ConflictingTransports)));
    }

    #[test]
    fn test_no_transport_rejected() {
        assert!(matches!(base_config().resolve(), Err(ConfigError::MissingTransport)));
    }

    #[test]
    fn test_socket_mode_strips_trailing_slash() {
        let config = AuthConfig {
            port: Some(9000),
            ..base_config()
        };
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.callback_url, "https://auth.example.com");
        assert_eq!(resolved.transport, TransportMode::Socket { port: 9000 });
        assert_eq!(resolved.secret, b"secret-key");
    }

    #[test]
    fn test_http_mode_appends_uri() {
        let config = AuthConfig {
            http_server: Some(Router::new()),
            ..base_config()
        };
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.callback_url, "https://auth.example.com/enface");
        assert_eq!(resolved.transport, TransportMode::Http);
    }

    #[test]
    fn test_invalid_secret_rejected() {
        let config = AuthConfig {
            port: Some(9000),
            secret_code: "not base64!!".into(),
            ..base_config()
        };
        assert!(matches!(config.resolve(), Err(ConfigError::InvalidSecret(_))));
    }

    #[test]
    fn test_missing_project_id() {
        let config = AuthConfig {
            port: Some(9000),
            project_id: String::new(),
            ..base_config()
        };
        assert!(matches!(config.resolve(), Err(ConfigError::Missing("projectId"))));
    }

    #[test]
    fn test_defaults() {
        let config = AuthConfig::default();
        assert_eq!(config.session_ttl, AUTHORIZATION_TIME_FRAME);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(!config.debug);
    }
}
