//! Enface Auth Server
//!
//! Standalone pairing server. Runs the WebSocket transport when
//! `ENFACE_PORT` is set, or mounts the HTTP route on its own axum router
//! when `ENFACE_HTTP_ADDR` is set.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use enface_auth::{
    AuthConfig, AuthServer, Backend, JwtConfig, JwtValidator, MemoryBackend, HTTP_URI, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = AuthConfig::from_env();

    // Initialize logging
    let default_level = if config.debug {
        "enface_auth=debug"
    } else {
        "enface_auth=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Enface Auth Server v{}", VERSION);

    let http_addr: Option<SocketAddr> = match std::env::var("ENFACE_HTTP_ADDR") {
        Ok(v) => Some(v.parse().context("ENFACE_HTTP_ADDR is not a socket address")?),
        Err(_) => None,
    };
    if http_addr.is_some() {
        config.http_server = Some(Router::new().route("/health", get(|| async { "ok" })));
    }

    let server =
        Arc::new(AuthServer::new(config, build_backend()).context("invalid configuration")?);

    match (server.router(), http_addr) {
        (Some(router), Some(addr)) => {
            let listener = TcpListener::bind(addr).await?;
            info!("Pairing route on http://{}{}", addr, HTTP_URI);
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
        _ => {
            let s = server.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    s.shutdown();
                }
            });
            server.run().await?;
        }
    }

    info!("Server stopped");
    Ok(())
}

/// In-memory capabilities, with JWT credentials when `AUTH_*` is configured.
fn build_backend() -> Backend {
    let jwt = JwtConfig::from_env();

    let mut memory = MemoryBackend::new();
    if jwt.secret.is_some() {
        memory = memory.with_issuer(jwt.clone());
    }
    // ENFACE_DEMO_CREDENTIALS="credential:user,credential2:user2"
    if let Ok(pairs) = std::env::var("ENFACE_DEMO_CREDENTIALS") {
        for (credential, user_id) in pairs.split(',').filter_map(|p| p.split_once(':')) {
            memory.add_credential(credential.trim(), user_id.trim());
        }
    }

    let backend = Backend::from_shared(Arc::new(memory));
    if jwt.is_configured() {
        info!("Validating credentials as JWTs");
        backend.with_validator(Arc::new(JwtValidator::new(jwt)))
    } else {
        warn!("AUTH_SECRET / AUTH_PUBLIC_KEY_PEM not set; only demo credentials are accepted");
        backend
    }
}
