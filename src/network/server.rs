//! Pairing Server
//!
//! Hosts the dispatcher on one of two transports:
//!
//! - **Socket mode**: own TCP listener, one WebSocket per device, heartbeat
//!   sweeps evict dead sockets.
//! - **HTTP mode**: a POST route mounted on the host's axum router; each
//!   request is one single-shot exchange.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, instrument};

use crate::backend::Backend;
use crate::config::{AuthConfig, ConfigError, ResolvedConfig, TransportMode, HTTP_URI};
use crate::network::dispatcher::Dispatcher;
use crate::network::heartbeat::LivenessMonitor;
use crate::network::session::SessionManager;
use crate::network::transport::{Connection, HttpExchange, Outbound, SocketLink, CLOSE_SENTINEL};

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// `run` called on a server configured for HTTP mode.
    #[error("Server is in HTTP mode; mount the router on the host server instead")]
    NotSocketMode,
}

/// The pairing server.
pub struct AuthServer {
    /// Server configuration.
    config: AuthConfig,
    /// Validated settings.
    resolved: ResolvedConfig,
    /// Protocol state machine and session store.
    dispatcher: Arc<Dispatcher>,
    /// Live sockets.
    monitor: Arc<LivenessMonitor>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl AuthServer {
    /// Validate `config` and build the server. Fails fast on bad configuration.
    pub fn new(config: AuthConfig, backend: Backend) -> Result<Self, ConfigError> {
        let resolved = config.resolve()?;
        let sessions = SessionManager::new(config.session_ttl);
        let dispatcher = Arc::new(Dispatcher::new(&resolved, sessions, backend));
        let (shutdown_tx, _) = broadcast::channel(1);

        if config.debug {
            debug!(
                project = %resolved.project_id,
                callback = %resolved.callback_url,
                "pairing server configured"
            );
        }

        Ok(Self {
            config,
            resolved,
            dispatcher,
            monitor: Arc::new(LivenessMonitor::new()),
            shutdown_tx,
        })
    }

    /// Host router with the pairing route mounted. `None` in socket mode.
    pub fn router(&self) -> Option<Router> {
        let host = self.config.http_server.clone()?;
        let route = Router::new()
            .route(HTTP_URI, post(handle_http))
            .layer(CorsLayer::permissive())
            .with_state(self.dispatcher.clone());
        Some(host.merge(route))
    }

    /// Bind the configured port and serve WebSocket clients until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ServerError> {
        let TransportMode::Socket { port } = self.resolved.transport else {
            return Err(ServerError::NotSocketMode);
        };
        let addr = SocketAddr::new(self.config.bind_host, port);
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve WebSocket clients on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.resolved.transport == TransportMode::Http {
            return Err(ServerError::NotSocketMode);
        }
        info!("Pairing server listening on {}", listener.local_addr()?);

        let heartbeat_cancel = CancellationToken::new();
        let heartbeat_handle = tokio::spawn(
            self.monitor
                .clone()
                .run(self.config.heartbeat_interval, heartbeat_cancel.clone()),
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        heartbeat_cancel.cancel();
        let _ = heartbeat_handle.await;
        self.dispatcher.sessions().clear();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let dispatcher = self.dispatcher.clone();
        let monitor = self.monitor.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (link, mut outbound_rx) = SocketLink::new();
            let link = Arc::new(link);
            let terminated = link.terminated();
            let client = dispatcher.open(link.clone());
            monitor.register(link.clone());
            info!(%addr, connection = %client.id(), "client connected");

            // Writer: flushes queued frames, then closes once terminated
            let writer_terminated = terminated.clone();
            let sender_task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        frame = outbound_rx.recv() => {
                            let msg = match frame {
                                Some(Outbound::Text(text)) => Message::Text(text),
                                Some(Outbound::Ping) => Message::Ping(Vec::new()),
                                None => break,
                            };
                            if ws_sender.send(msg).await.is_err() {
                                break;
                            }
                        }
                        () = writer_terminated.cancelled() => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            });

            // One dispatch at a time. Pong and Close are still read while it runs.
            let mut queued: VecDeque<String> = VecDeque::new();
            let mut in_flight: Option<JoinHandle<()>> = None;

            loop {
                if in_flight.is_none() {
                    if let Some(raw) = queued.pop_front() {
                        let dispatcher = dispatcher.clone();
                        let client = client.clone();
                        in_flight = Some(tokio::spawn(async move {
                            dispatcher.handle(&client, &raw).await;
                        }));
                    }
                }

                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => queued.push_back(text),
                            Some(Ok(Message::Binary(data))) => {
                                queued.push_back(String::from_utf8_lossy(&data).into_owned());
                            }
                            Some(Ok(Message::Pong(_))) => {
                                link.mark_alive();
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                debug!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    () = join_dispatch(&mut in_flight), if in_flight.is_some() => {
                        in_flight = None;
                    }
                    () = terminated.cancelled() => {
                        debug!(connection = %client.id(), "connection terminated");
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            // Cleanup
            monitor.unregister(link.key());
            dispatcher.sessions().finalize(&client.id());
            link.close();
            let _ = sender_task.await;

            info!("Client {} cleaned up", addr);
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Session store.
    pub fn sessions(&self) -> &SessionManager {
        self.dispatcher.sessions()
    }

    /// Live session count.
    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Open WebSocket connection count.
    pub fn connection_count(&self) -> usize {
        self.monitor.len()
    }
}

/// Wait for the dispatch in flight, if any.
async fn join_dispatch(task: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = task {
        if let Err(e) = handle.await {
            error!("Dispatch task failed: {}", e);
        }
    }
}

/// POST [`HTTP_URI`]: one single-shot exchange.
async fn handle_http(State(dispatcher): State<Arc<Dispatcher>>, body: Bytes) -> impl IntoResponse {
    let (exchange, response) = HttpExchange::new();
    let exchange: Arc<dyn Connection> = Arc::new(exchange);
    let client = dispatcher.open(exchange);

    let worker = dispatcher.clone();
    tokio::spawn(async move {
        let raw = String::from_utf8_lossy(&body);
        worker.handle(&client, &raw).await;
    });

    let payload = response.await.unwrap_or_else(|_| CLOSE_SENTINEL.to_string());
    ([(header::CONTENT_TYPE, "application/json")], payload)
}
