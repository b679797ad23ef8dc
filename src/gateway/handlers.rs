//! Built-in connection handlers
//!
//! Bound on every connection by the gateway binary: the `ping`/`pong`
//! connectivity check, disconnect logging, and forwarding of configured event
//! names to the backend.

use std::sync::Arc;

use tracing::debug;

use super::Socket;
use crate::server::events;

/// Bind the built-in handlers on a new connection
pub fn install(socket: &mut Socket<'_>, forward: &[String]) {
    socket.on(events::PING, |ctx, _| {
        ctx.emit(events::PONG, None);
    });

    socket.on(events::DISCONNECT, |ctx, data| {
        let reason = data
            .and_then(|d| d.get("reason"))
            .and_then(|r| r.as_str())
            .unwrap_or("unknown");
        debug!("Disconnect handler for {} ({})", ctx.id(), reason);
    });

    for name in forward {
        let event: Arc<str> = Arc::from(name.as_str());
        socket.on(name.clone(), move |ctx, data| {
            ctx.submit(&event, data.cloned());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendResult, Job, ResultSink};
    use crate::gateway::{Connection, ConnectionId, Dispatcher};
    use crate::server::EventFrame;
    use axum::extract::ws::Message;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingBackend {
        jobs: Mutex<Vec<Job>>,
    }

    impl Backend for RecordingBackend {
        fn start(&self, _results: ResultSink) -> BackendResult<()> {
            Ok(())
        }

        fn submit(&self, job: Job) -> BackendResult<()> {
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }
    }

    fn setup(forward: Vec<String>) -> (Dispatcher, Arc<RecordingBackend>, mpsc::UnboundedReceiver<Message>) {
        let backend = Arc::new(RecordingBackend::default());
        let mut dispatcher = Dispatcher::new(backend.clone());
        dispatcher.add_hook(Arc::new(move |socket: &mut Socket<'_>| install(socket, &forward)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher
            .open(Connection::new(ConnectionId::from("a"), None, tx))
            .unwrap();
        let _greeting = rx.try_recv().unwrap();
        (dispatcher, backend, rx)
    }

    #[test]
    fn test_ping_pong() {
        let (mut dispatcher, _backend, mut rx) = setup(Vec::new());
        dispatcher.dispatch(&ConnectionId::from("a"), &EventFrame::new(events::PING));

        match rx.try_recv().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"event":"pong"}"#),
            other => panic!("Expected pong, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_forwarded_events_reach_backend() {
        let (mut dispatcher, backend, mut rx) = setup(vec!["score".to_string()]);
        let id = ConnectionId::from("a");

        dispatcher.dispatch(&id, &EventFrame::with_data("score", json!({ "points": 5 })));
        dispatcher.dispatch(&id, &EventFrame::new("not-forwarded"));

        let jobs = backend.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].event, "score");
        assert_eq!(jobs[0].data, Some(json!({ "points": 5 })));
        assert!(rx.try_recv().is_err());
    }
}
