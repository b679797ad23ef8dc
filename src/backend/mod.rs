//! Backend bridge
//!
//! The narrow capability the gateway needs from the computation worker:
//! start it once, submit work without blocking, and receive results through
//! a [`ResultSink`]. How the worker queues, stores or retries is its own
//! business.

mod worker;

pub use worker::*;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gateway::ConnectionId;

/// Errors reported by a backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Backend not started")]
    NotStarted,

    #[error("Backend already started")]
    AlreadyStarted,

    #[error("Backend queue is full")]
    QueueFull,

    #[error("Backend stopped")]
    Stopped,

    #[error("Gateway no longer accepts results")]
    GatewayClosed,

    #[error("Invalid backend settings: {0}")]
    InvalidSettings(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A unit of work submitted on behalf of a connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique job identifier
    pub id: Uuid,
    /// Connection the work originated from
    pub origin: ConnectionId,
    /// Inbound event that produced the job
    pub event: String,
    /// Inbound payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Job {
    pub fn new(origin: ConnectionId, event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            event: event.into(),
            data,
        }
    }
}

/// Where a result should be delivered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Target {
    /// A single connection
    Connection(ConnectionId),
    /// Every open connection
    Broadcast,
}

/// A result produced by the worker, routed back out by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkResult {
    pub target: Target,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WorkResult {
    /// Result addressed to one connection
    pub fn to_connection(id: ConnectionId, event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            target: Target::Connection(id),
            event: event.into(),
            data,
        }
    }

    /// Result addressed to every connection
    pub fn broadcast(event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            target: Target::Broadcast,
            event: event.into(),
            data,
        }
    }
}

/// Channel through which a backend hands results to the gateway loop
#[derive(Debug, Clone)]
pub struct ResultSink {
    tx: mpsc::UnboundedSender<WorkResult>,
}

impl ResultSink {
    /// Create a sink and the receiver the gateway loop drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Hand a result to the gateway. Never blocks.
    pub fn deliver(&self, result: WorkResult) -> BackendResult<()> {
        self.tx
            .send(result)
            .map_err(|_| BackendError::GatewayClosed)
    }
}

/// Capability interface of the computation worker
///
/// Both methods must return promptly; any blocking work belongs inside the
/// implementation's own tasks.
pub trait Backend: Send + Sync {
    /// Start the worker. Called once at bootstrap.
    fn start(&self, results: ResultSink) -> BackendResult<()>;

    /// Submit a job without waiting for it to run
    fn submit(&self, job: Job) -> BackendResult<()>;
}
