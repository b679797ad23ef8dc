//! WebSocket server implementation
//!
//! Serves the health check and the WebSocket upgrade on one port, and runs
//! every upgraded socket as an event channel registered with the gateway
//! loop.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

use super::protocol::EventFrame;
use crate::gateway::{CloseReason, Connection, ConnectionId, GatewayHandle};

/// Default maximum WebSocket message size (1MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default time allowed to answer a request, upgrade handshake included
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Plain HTTP liveness route
pub const HEALTH_PATH: &str = "/health";

/// Time given to a connection's writer to flush after the reader stops
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Largest accepted WebSocket message
    pub max_message_size: usize,
    /// Deadline for answering a request
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Set the maximum message size
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// State shared by the HTTP handlers
#[derive(Clone)]
struct AppState {
    gateway: GatewayHandle,
    shutdown_tx: broadcast::Sender<()>,
    max_message_size: usize,
}

/// WebSocket server feeding connections into the gateway loop
pub struct WebSocketServer {
    config: ServerConfig,
    gateway: GatewayHandle,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, gateway: GatewayHandle, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            config,
            gateway,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Gateway listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Routes: `GET /health`, and a WebSocket upgrade on every other path.
    ///
    /// CORS is permissive, so preflights are answered and every response
    /// carries `Access-Control-Allow-Origin: *`.
    pub fn router(&self) -> Router {
        let state = AppState {
            gateway: self.gateway.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            max_message_size: self.config.max_message_size,
        };

        Router::new()
            .route(HEALTH_PATH, get(health_handler))
            .fallback(upgrade_handler)
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TimeoutLayer::new(self.config.handshake_timeout))
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let app = self.router();

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Shutdown signal received, stopping listener");
            })
            .await?;

        Ok(())
    }
}

/// Liveness check, independent of connection count
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

/// Upgrade to an event channel; plain requests to unknown paths get 404
async fn upgrade_handler(
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(_) if !headers.contains_key(header::UPGRADE) => {
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(rejection) => {
            debug!("Handshake rejected for {}: {}", peer_addr, rejection);
            return rejection.into_response();
        }
    };

    ws.max_message_size(state.max_message_size)
        .max_frame_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, peer_addr, state))
}

/// Run one upgraded socket until either side closes it
async fn handle_socket(socket: WebSocket, peer_addr: SocketAddr, state: AppState) {
    let AppState {
        gateway,
        shutdown_tx,
        ..
    } = state;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Register with the gateway before reading any frame
    let id = ConnectionId::generate();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = Connection::new(id.clone(), Some(peer_addr), tx.clone());
    if let Err(e) = gateway.open(connection).await {
        error!("Failed to register connection from {}: {}", peer_addr, e);
        if let Err(e) = ws_sender.send(Message::Close(None)).await {
            debug!("Close to {} failed: {}", peer_addr, e);
        }
        return;
    }
    debug!("Connection {} from {}", id, peer_addr);

    // Writer: drains the outbound queue until every sender is gone or a
    // close frame goes out
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_sender.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Message handling loop
    let reason = loop {
        tokio::select! {
            // Receive messages from client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match EventFrame::from_json(text.as_str()) {
                            Ok(frame) => {
                                if gateway.inbound(id.clone(), frame).is_err() {
                                    debug!("Gateway loop gone, dropping {}", id);
                                    break CloseReason::ServerShutdown;
                                }
                            }
                            Err(e) => {
                                debug!("Rejected frame from {}: {}", id, e);
                                let error_frame = EventFrame::from(e);
                                if let Ok(json) = error_frame.to_json() {
                                    let _ = tx.send(Message::Text(json.into()));
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", id, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pong messages
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Client {} requested close", id);
                        break CloseReason::ClientClosed;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", id, e);
                        break CloseReason::TransportError;
                    }
                    None => {
                        break CloseReason::ClientClosed;
                    }
                }
            }
            // Handle shutdown signal
            _ = shutdown_rx.recv() => {
                let _ = tx.send(Message::Close(None));
                break CloseReason::ServerShutdown;
            }
        }
    };

    // Unregisters the connection and runs its disconnect handlers. A
    // connection the gateway already closed is left alone.
    if let Err(e) = gateway.closed(id.clone(), reason) {
        debug!("Could not report close of {}: {}", id, e);
    }
    drop(tx);

    if tokio::time::timeout(WRITER_GRACE, writer).await.is_err() {
        debug!("Writer for {} did not finish in time", id);
    }

    debug!("Connection {} from {} finished ({})", id, peer_addr, reason);
}
