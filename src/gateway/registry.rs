//! Connection registry
//!
//! Tracks every live client connection by its identifier. The registry is
//! owned by the gateway loop, so none of its methods lock or block.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::dispatcher::HandlerTable;

/// Errors raised by registry operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connection identifier already registered: {0}")]
    DuplicateIdentifier(ConnectionId),

    #[error("Connection not found: {0}")]
    UnknownConnection(ConnectionId),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Opaque identifier assigned to a connection at handshake time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Handshake done, handlers not yet bound
    Connecting,
    /// Events are dispatched
    Open,
    /// Terminal; nothing is dispatched or delivered
    Closed,
}

/// Sender half of a connection's outbound queue
pub type Outbound = mpsc::UnboundedSender<Message>;

/// One live client channel
pub struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    state: ConnectionState,
    outbound: Outbound,
    pub(crate) handlers: HandlerTable,
}

impl Connection {
    /// Create a connection in the `Connecting` state
    pub fn new(id: ConnectionId, peer_addr: Option<SocketAddr>, outbound: Outbound) -> Self {
        Self {
            id,
            peer_addr,
            state: ConnectionState::Connecting,
            outbound,
            handlers: HandlerTable::default(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Move from `Connecting` to `Open`. A closed connection stays closed.
    pub fn open(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Open;
        }
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Queue a message for the connection's writer task.
    ///
    /// Returns false if the writer has already gone away.
    pub fn send(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Process-wide map of connection identifier to connection
#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection; an identifier that is already present is refused
    pub fn register(&mut self, connection: Connection) -> RegistryResult<()> {
        if self.connections.contains_key(connection.id()) {
            return Err(RegistryError::DuplicateIdentifier(connection.id().clone()));
        }
        self.connections.insert(connection.id().clone(), connection);
        Ok(())
    }

    /// Remove a connection. Removing an absent identifier is a no-op.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        self.connections.remove(id)
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn lookup_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Connection),
    {
        for connection in self.connections.values() {
            f(connection);
        }
    }

    /// Snapshot of the registered identifiers
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.connections.clear();
    }
}
