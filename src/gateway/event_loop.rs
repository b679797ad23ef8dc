//! Gateway event loop
//!
//! A single task owns the dispatcher (and with it the registry). Connection
//! tasks and the backend talk to it through channels, so every registry
//! mutation happens on this one loop and nothing needs a lock.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use super::dispatcher::{CloseReason, ConnectionHook, Dispatcher, Socket};
use super::registry::{Connection, ConnectionId, RegistryError};
use crate::backend::{Backend, ResultSink, WorkResult};
use crate::server::EventFrame;

/// Errors surfaced through the gateway handle
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Gateway loop is not running")]
    Closed,
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Requests handled by the gateway loop
enum Command {
    Open {
        connection: Connection,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Inbound {
        id: ConnectionId,
        frame: EventFrame,
    },
    Closed {
        id: ConnectionId,
        reason: CloseReason,
    },
    Emit {
        id: ConnectionId,
        frame: EventFrame,
    },
    Broadcast {
        frame: EventFrame,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the gateway loop
///
/// Every method except the awaited queries returns immediately.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Open { connection, .. } => write!(f, "Open({})", connection.id()),
            Command::Inbound { id, frame } => write!(f, "Inbound({}, {})", id, frame.event),
            Command::Closed { id, reason } => write!(f, "Closed({}, {})", id, reason),
            Command::Emit { id, frame } => write!(f, "Emit({}, {})", id, frame.event),
            Command::Broadcast { frame } => write!(f, "Broadcast({})", frame.event),
            Command::Count { .. } => write!(f, "Count"),
        }
    }
}

impl GatewayHandle {
    /// Register and open a freshly handshaken connection
    pub async fn open(&self, connection: Connection) -> GatewayResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Open { connection, reply })
            .map_err(|_| GatewayError::Closed)?;
        rx.await.map_err(|_| GatewayError::Closed)??;
        Ok(())
    }

    /// Forward an inbound event for dispatch
    pub fn inbound(&self, id: ConnectionId, frame: EventFrame) -> GatewayResult<()> {
        self.send(Command::Inbound { id, frame })
    }

    /// Report that a connection's transport went away
    pub fn closed(&self, id: ConnectionId, reason: CloseReason) -> GatewayResult<()> {
        self.send(Command::Closed { id, reason })
    }

    /// Emit an event to one connection
    pub fn emit(&self, id: ConnectionId, event: &str, data: Option<Value>) -> GatewayResult<()> {
        self.send(Command::Emit {
            id,
            frame: EventFrame {
                event: event.to_string(),
                data,
            },
        })
    }

    /// Emit an event to every open connection
    pub fn broadcast(&self, event: &str, data: Option<Value>) -> GatewayResult<()> {
        self.send(Command::Broadcast {
            frame: EventFrame {
                event: event.to_string(),
                data,
            },
        })
    }

    /// Number of registered connections
    pub async fn connection_count(&self) -> GatewayResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Count { reply })?;
        rx.await.map_err(|_| GatewayError::Closed)
    }

    fn send(&self, command: Command) -> GatewayResult<()> {
        self.tx.send(command).map_err(|_| GatewayError::Closed)
    }
}

/// The gateway loop: dispatcher plus the channels that feed it
pub struct Gateway {
    dispatcher: Dispatcher,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    results_sink: ResultSink,
    results: mpsc::UnboundedReceiver<WorkResult>,
}

impl Gateway {
    /// Create a gateway that submits work to `backend`
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (results_sink, results) = ResultSink::channel();
        Self {
            dispatcher: Dispatcher::new(backend),
            commands_tx,
            commands,
            results_sink,
            results,
        }
    }

    /// Add a hook that binds handlers on every new connection
    pub fn on_connection<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Socket<'_>) + Send + Sync + 'static,
    {
        let hook: ConnectionHook = Arc::new(hook);
        self.dispatcher.add_hook(hook);
        self
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            tx: self.commands_tx.clone(),
        }
    }

    /// Sink the backend uses to deliver results
    pub fn result_sink(&self) -> ResultSink {
        self.results_sink.clone()
    }

    /// Run until a shutdown signal arrives
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("Gateway loop started");

        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => {
                    self.handle_command(command);
                }
                Some(result) = self.results.recv() => {
                    self.dispatcher.deliver(result);
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing gateway loop");
                    break;
                }
            }
        }

        self.dispatcher.shutdown();
        info!("Gateway loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        debug!("Gateway command: {:?}", command);
        match command {
            Command::Open { connection, reply } => {
                let _ = reply.send(self.dispatcher.open(connection));
            }
            Command::Inbound { id, frame } => {
                self.dispatcher.dispatch(&id, &frame);
            }
            Command::Closed { id, reason } => {
                self.dispatcher.close(&id, reason);
            }
            Command::Emit { id, frame } => {
                self.dispatcher.emit(&id, &frame.event, frame.data);
            }
            Command::Broadcast { frame } => {
                self.dispatcher.broadcast(&frame.event, frame.data);
            }
            Command::Count { reply } => {
                let _ = reply.send(self.dispatcher.connection_count());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResult, Job};
    use crate::server::events;
    use axum::extract::ws::Message;
    use serde_json::json;
    use std::time::Duration;

    struct NullBackend;

    impl Backend for NullBackend {
        fn start(&self, _results: ResultSink) -> BackendResult<()> {
            Ok(())
        }

        fn submit(&self, _job: Job) -> BackendResult<()> {
            Ok(())
        }
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> EventFrame {
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        match message {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("Expected text message, got {:?}", other),
        }
    }

    async fn open(handle: &GatewayHandle, id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle
            .open(Connection::new(ConnectionId::from(id), None, tx))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut rx).await.event, events::CONNECT);
        rx
    }

    fn spawn_gateway(gateway: Gateway) -> (GatewayHandle, broadcast::Sender<()>) {
        let handle = gateway.handle();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(gateway.run(shutdown_rx));
        (handle, shutdown_tx)
    }

    #[tokio::test]
    async fn test_open_and_count() {
        let (handle, _shutdown) = spawn_gateway(Gateway::new(Arc::new(NullBackend)));
        let _a = open(&handle, "a").await;
        let _b = open(&handle, "b").await;
        assert_eq!(handle.connection_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_open_is_reported() {
        let (handle, _shutdown) = spawn_gateway(Gateway::new(Arc::new(NullBackend)));
        let _a = open(&handle, "a").await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let result = handle
            .open(Connection::new(ConnectionId::from("a"), None, tx))
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::Registry(RegistryError::DuplicateIdentifier(_)))
        ));
        assert_eq!(handle.connection_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_inbound_events_keep_order() {
        let gateway = Gateway::new(Arc::new(NullBackend)).on_connection(|socket| {
            socket.on("n", |ctx, data| {
                ctx.emit("n", data.cloned());
            });
        });
        let (handle, _shutdown) = spawn_gateway(gateway);
        let mut a = open(&handle, "a").await;

        for n in 0..20 {
            handle
                .inbound(ConnectionId::from("a"), EventFrame::with_data("n", json!(n)))
                .unwrap();
        }
        for n in 0..20 {
            assert_eq!(next_frame(&mut a).await.data, Some(json!(n)));
        }
    }

    #[tokio::test]
    async fn test_results_are_routed() {
        let gateway = Gateway::new(Arc::new(NullBackend));
        let sink = gateway.result_sink();
        let (handle, _shutdown) = spawn_gateway(gateway);
        let mut a = open(&handle, "a").await;

        sink.deliver(WorkResult::to_connection(
            ConnectionId::from("a"),
            "result",
            Some(json!({ "score": 10 })),
        ))
        .unwrap();
        let frame = next_frame(&mut a).await;
        assert_eq!(frame.event, "result");
        assert_eq!(frame.data, Some(json!({ "score": 10 })));
    }

    #[tokio::test]
    async fn test_closed_then_emit_is_noop() {
        let (handle, _shutdown) = spawn_gateway(Gateway::new(Arc::new(NullBackend)));
        let mut a = open(&handle, "a").await;

        handle
            .closed(ConnectionId::from("a"), CloseReason::ClientClosed)
            .unwrap();
        handle.emit(ConnectionId::from("a"), "late", None).unwrap();
        assert_eq!(handle.connection_count().await.unwrap(), 0);

        // Registry dropped the sender, so the queue drains to the end
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (handle, shutdown) = spawn_gateway(Gateway::new(Arc::new(NullBackend)));
        let mut a = open(&handle, "a").await;

        shutdown.send(()).unwrap();
        assert!(matches!(a.recv().await, Some(Message::Close(None))));
        assert!(a.recv().await.is_none());
    }
}
