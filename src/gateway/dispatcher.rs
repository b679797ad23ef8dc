//! Event dispatcher
//!
//! Routes inbound named events to the handlers bound on each connection and
//! emits events back out, to one connection or to all of them. Handlers run
//! synchronously on the gateway loop, in the order they were bound.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Message;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::registry::{Connection, ConnectionId, Registry, RegistryError, RegistryResult};
use crate::backend::{Backend, Job, Target, WorkResult};
use crate::server::{events, EventFrame};

/// A bound event handler
pub type Handler = Arc<dyn Fn(&mut EventContext<'_>, Option<&Value>) + Send + Sync>;

/// Hook run for every new connection, before it opens
pub type ConnectionHook = Arc<dyn Fn(&mut Socket<'_>) + Send + Sync>;

/// Why a connection went away
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Client sent a close frame or hung up
    ClientClosed,
    /// Read or write failed
    TransportError,
    /// A handler asked for the connection to be closed
    ServerDisconnect,
    /// Gateway is shutting down
    ServerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::TransportError => "transport_error",
            CloseReason::ServerDisconnect => "server_disconnect",
            CloseReason::ServerShutdown => "server_shutdown",
        };
        f.write_str(reason)
    }
}

// ============================================================================
// Handler table
// ============================================================================

/// Event name to ordered handler list, one per connection
#[derive(Default)]
pub struct HandlerTable {
    bindings: HashMap<String, Vec<Handler>>,
}

impl HandlerTable {
    pub fn bind(&mut self, event: impl Into<String>, handler: Handler) {
        self.bindings.entry(event.into()).or_default().push(handler);
    }

    /// Snapshot of the handlers bound to `event`, in binding order
    pub fn handlers_for(&self, event: &str) -> Vec<Handler> {
        self.bindings.get(event).cloned().unwrap_or_default()
    }

    /// Number of bound handlers across all events
    pub fn len(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }
}

// ============================================================================
// Outbound helpers
// ============================================================================

fn encode(frame: &EventFrame) -> Option<Message> {
    match frame.to_json() {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            error!("Failed to encode '{}' event: {}", frame.event, e);
            None
        }
    }
}

fn emit_frame(registry: &Registry, id: &ConnectionId, frame: &EventFrame) -> bool {
    let Some(connection) = registry.lookup(id).filter(|c| c.is_open()) else {
        debug!("Dropping '{}' for closed connection {}", frame.event, id);
        return false;
    };
    match encode(frame) {
        Some(message) => connection.send(message),
        None => false,
    }
}

fn broadcast_frame(registry: &Registry, frame: &EventFrame) -> usize {
    let Some(message) = encode(frame) else {
        return 0;
    };
    let mut delivered = 0;
    registry.for_each(|connection| {
        if connection.is_open() && connection.send(message.clone()) {
            delivered += 1;
        }
    });
    delivered
}

fn frame(event: &str, data: Option<Value>) -> EventFrame {
    EventFrame {
        event: event.to_string(),
        data,
    }
}

// ============================================================================
// Handler-facing views
// ============================================================================

/// View of a new connection handed to connection hooks for binding handlers
pub struct Socket<'a> {
    id: &'a ConnectionId,
    handlers: &'a mut HandlerTable,
}

impl Socket<'_> {
    pub fn id(&self) -> &ConnectionId {
        self.id
    }

    /// Bind a handler for `event` on this connection
    pub fn on<F>(&mut self, event: impl Into<String>, handler: F)
    where
        F: Fn(&mut EventContext<'_>, Option<&Value>) + Send + Sync + 'static,
    {
        self.handlers.bind(event, Arc::new(handler));
    }
}

/// What a handler can do while it runs
pub struct EventContext<'a> {
    id: &'a ConnectionId,
    registry: &'a Registry,
    backend: &'a dyn Backend,
    disconnecting: bool,
}

impl EventContext<'_> {
    /// Connection the event came from
    pub fn id(&self) -> &ConnectionId {
        self.id
    }

    /// Emit to the connection the event came from
    pub fn emit(&self, event: &str, data: Option<Value>) -> bool {
        emit_frame(self.registry, self.id, &frame(event, data))
    }

    /// Emit to every open connection
    pub fn broadcast(&self, event: &str, data: Option<Value>) -> usize {
        broadcast_frame(self.registry, &frame(event, data))
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Hand work to the backend on behalf of this connection.
    ///
    /// On failure the connection is told with an `unavailable` event.
    pub fn submit(&self, event: &str, data: Option<Value>) -> bool {
        let job = Job::new(self.id.clone(), event, data);
        let job_id = job.id;
        match self.backend.submit(job) {
            Ok(()) => {
                debug!("Submitted job {} ({}) for {}", job_id, event, self.id);
                true
            }
            Err(e) => {
                warn!("Backend rejected '{}' from {}: {}", event, self.id, e);
                emit_frame(
                    self.registry,
                    self.id,
                    &EventFrame::unavailable(event, e.to_string()),
                );
                false
            }
        }
    }

    /// Close this connection from the server side.
    ///
    /// A close frame is queued right away. Once the running handler returns,
    /// no further handlers run for this event, the connection is unregistered
    /// and its `disconnect` handlers get `server_disconnect`.
    pub fn disconnect(&mut self) -> bool {
        let Some(connection) = self.registry.lookup(self.id).filter(|c| c.is_open()) else {
            return false;
        };
        self.disconnecting = true;
        connection.send(Message::Close(None))
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Owns the registry and routes events in and out of it
pub struct Dispatcher {
    registry: Registry,
    hooks: Vec<ConnectionHook>,
    backend: Arc<dyn Backend>,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            registry: Registry::new(),
            hooks: Vec::new(),
            backend,
        }
    }

    /// Add a hook run for every connection before it opens
    pub fn add_hook(&mut self, hook: ConnectionHook) {
        self.hooks.push(hook);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Register a connection, bind handlers through the hooks and open it.
    ///
    /// The client gets a `connect` event with its id once it is open.
    pub fn open(&mut self, connection: Connection) -> RegistryResult<()> {
        let id = connection.id().clone();
        let peer = connection.peer_addr();
        self.registry.register(connection)?;

        if let Some(connection) = self.registry.lookup_mut(&id) {
            for hook in &self.hooks {
                let mut socket = Socket {
                    id: &id,
                    handlers: &mut connection.handlers,
                };
                hook(&mut socket);
            }
            connection.open();
        }

        info!(
            connection = %id,
            peer = ?peer,
            connections = self.registry.len(),
            "Connection open"
        );
        emit_frame(&self.registry, &id, &EventFrame::connected(id.as_str()));
        Ok(())
    }

    /// Bind a handler on an existing connection
    pub fn on<F>(&mut self, id: &ConnectionId, event: impl Into<String>, handler: F) -> RegistryResult<()>
    where
        F: Fn(&mut EventContext<'_>, Option<&Value>) + Send + Sync + 'static,
    {
        let connection = self
            .registry
            .lookup_mut(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;
        connection.handlers.bind(event, Arc::new(handler));
        Ok(())
    }

    /// Run the handlers bound to an inbound event.
    ///
    /// Events for unknown or non-open connections are dropped; events with
    /// no bound handler are ignored.
    pub fn dispatch(&mut self, id: &ConnectionId, frame: &EventFrame) {
        let handlers = match self.registry.lookup(id) {
            Some(connection) if connection.is_open() => connection.handlers.handlers_for(&frame.event),
            Some(connection) => {
                debug!(
                    "Dropping '{}' from {} in state {:?}",
                    frame.event,
                    id,
                    connection.state()
                );
                return;
            }
            None => {
                debug!("Dropping '{}' from closed connection {}", frame.event, id);
                return;
            }
        };

        if handlers.is_empty() {
            debug!("No handler for '{}' on {}", frame.event, id);
            return;
        }

        let mut ctx = EventContext {
            id,
            registry: &self.registry,
            backend: self.backend.as_ref(),
            disconnecting: false,
        };
        for handler in handlers {
            handler(&mut ctx, frame.data.as_ref());
            if ctx.disconnecting {
                break;
            }
        }

        if ctx.disconnecting {
            self.close(id, CloseReason::ServerDisconnect);
        }
    }

    /// Emit to exactly one connection. A missing target is a no-op.
    pub fn emit(&self, id: &ConnectionId, event: &str, data: Option<Value>) -> bool {
        emit_frame(&self.registry, id, &frame(event, data))
    }

    /// Emit to every connection open right now
    pub fn broadcast(&self, event: &str, data: Option<Value>) -> usize {
        broadcast_frame(&self.registry, &frame(event, data))
    }

    /// Unregister a connection, then run its `disconnect` handlers.
    ///
    /// Closing an unknown connection is a no-op.
    pub fn close(&mut self, id: &ConnectionId, reason: CloseReason) {
        let Some(mut connection) = self.registry.remove(id) else {
            return;
        };
        connection.close();
        let handlers = connection.handlers.handlers_for(events::DISCONNECT);
        drop(connection);

        info!(
            connection = %id,
            %reason,
            connections = self.registry.len(),
            "Connection closed"
        );

        let payload = json!({ "reason": reason });
        let mut ctx = EventContext {
            id,
            registry: &self.registry,
            backend: self.backend.as_ref(),
            disconnecting: false,
        };
        for handler in handlers {
            handler(&mut ctx, Some(&payload));
        }
    }

    /// Route a result produced by the backend
    pub fn deliver(&self, result: WorkResult) {
        let WorkResult {
            target,
            event,
            data,
        } = result;
        match target {
            Target::Connection(id) => {
                if !self.emit(&id, &event, data) {
                    debug!("Result '{}' for {} dropped, connection gone", event, id);
                }
            }
            Target::Broadcast => {
                let delivered = self.broadcast(&event, data);
                debug!("Result '{}' broadcast to {} connections", event, delivered);
            }
        }
    }

    /// Close every connection and empty the registry
    pub fn shutdown(&mut self) {
        if !self.registry.is_empty() {
            info!("Closing {} connections", self.registry.len());
        }
        let ids = self.registry.ids();
        for id in ids {
            if let Some(connection) = self.registry.lookup(&id) {
                connection.send(Message::Close(None));
            }
            self.close(&id, CloseReason::ServerShutdown);
        }
        self.registry.clear();
    }
}
