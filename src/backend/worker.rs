//! Local queue worker
//!
//! In-process [`Backend`] implementation: a bounded job queue drained by a
//! single task that runs each job through a [`Processor`] on the blocking
//! thread pool and hands the result back to the gateway.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::{Backend, BackendError, BackendResult, Job, ResultSink, WorkResult};

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Event name used by [`EchoProcessor`] results
pub const RESULT_EVENT: &str = "result";

/// Connection settings handed to the worker
///
/// The gateway never interprets the URLs; they are passed through as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendSettings {
    /// Message queue / cache connection string
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Persistent storage connection string
    #[serde(default)]
    pub database_url: String,
    /// Maximum number of queued jobs
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_redis_url() -> String {
    DEFAULT_REDIS_URL.to_string()
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            database_url: String::new(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BackendSettings {
    pub fn validate(&self) -> BackendResult<()> {
        if self.queue_capacity == 0 {
            return Err(BackendError::InvalidSettings(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        if !self.redis_url.contains("://") {
            return Err(BackendError::InvalidSettings(format!(
                "redis_url '{}' has no scheme",
                redact_url(&self.redis_url)
            )));
        }
        Ok(())
    }
}

/// Hide credentials in a connection string before logging it
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{}://***@{}", scheme, host),
        None => url.to_string(),
    }
}

/// The computation run for each job
///
/// Called on the blocking thread pool, so it may block.
pub trait Processor: Send + Sync + 'static {
    fn process(&self, job: Job) -> Option<WorkResult>;
}

/// Placeholder processor that hands each job's payload back to its origin
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProcessor;

impl Processor for EchoProcessor {
    fn process(&self, job: Job) -> Option<WorkResult> {
        Some(WorkResult::to_connection(
            job.origin,
            RESULT_EVENT,
            Some(json!({ "event": job.event, "data": job.data })),
        ))
    }
}

/// Backend backed by an in-process bounded queue
pub struct LocalWorker {
    settings: BackendSettings,
    processor: Arc<dyn Processor>,
    queue: OnceLock<mpsc::Sender<Job>>,
}

impl LocalWorker {
    pub fn new(settings: BackendSettings, processor: impl Processor) -> Self {
        Self {
            settings,
            processor: Arc::new(processor),
            queue: OnceLock::new(),
        }
    }
}

impl Backend for LocalWorker {
    fn start(&self, results: ResultSink) -> BackendResult<()> {
        self.settings.validate()?;

        let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
        self.queue
            .set(tx)
            .map_err(|_| BackendError::AlreadyStarted)?;

        tokio::spawn(run_worker(rx, Arc::clone(&self.processor), results));

        info!(
            "Worker started (queue: {}, store: {}, capacity: {})",
            redact_url(&self.settings.redis_url),
            if self.settings.database_url.is_empty() {
                "<none>".to_string()
            } else {
                redact_url(&self.settings.database_url)
            },
            self.settings.queue_capacity
        );
        Ok(())
    }

    fn submit(&self, job: Job) -> BackendResult<()> {
        let queue = self.queue.get().ok_or(BackendError::NotStarted)?;
        queue.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => BackendError::QueueFull,
            TrySendError::Closed(_) => BackendError::Stopped,
        })
    }
}

/// Drain the queue until it closes or the gateway stops taking results
async fn run_worker(
    mut rx: mpsc::Receiver<Job>,
    processor: Arc<dyn Processor>,
    results: ResultSink,
) {
    while let Some(job) = rx.recv().await {
        let job_id = job.id;
        let processor = Arc::clone(&processor);

        match tokio::task::spawn_blocking(move || processor.process(job)).await {
            Ok(Some(result)) => {
                if results.deliver(result).is_err() {
                    info!("Gateway closed, stopping worker");
                    break;
                }
            }
            Ok(None) => {
                debug!("Job {} produced no result", job_id);
            }
            Err(e) => {
                warn!("Job {} failed: {}", job_id, e);
            }
        }
    }
    debug!("Worker queue drained");
}
