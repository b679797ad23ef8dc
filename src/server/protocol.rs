//! Protocol message definitions
//!
//! Defines the event frames exchanged between clients and the gateway.
//! Every frame is a JSON text message carrying an event name and an optional
//! payload: `{"event": "ping"}` or `{"event": "announce", "data": {"count": 2}}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Current protocol version, reported in the `connect` event
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum event name length
pub const MAX_EVENT_NAME_LENGTH: usize = 128;

/// Reserved event names
pub mod events {
    /// Connectivity check sent by clients
    pub const PING: &str = "ping";
    /// Answer to `ping`
    pub const PONG: &str = "pong";
    /// Sent once to a client right after its connection opens
    pub const CONNECT: &str = "connect";
    /// Fired by the gateway when a connection goes away
    pub const DISCONNECT: &str = "disconnect";
    /// Rejected inbound frame
    pub const ERROR: &str = "error";
    /// Backend could not accept submitted work
    pub const UNAVAILABLE: &str = "unavailable";

    /// Names clients are not allowed to send
    pub const RESERVED_INBOUND: &[&str] = &[CONNECT, DISCONNECT];
}

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be parsed
    InvalidMessage,
    /// Frame parsed but used a reserved or malformed event name
    InvalidEvent,
    /// Backend refused or could not accept the work
    BackendUnavailable,
}

// ============================================================================
// Event Frame
// ============================================================================

/// A named event with an optional JSON payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    /// Event name, matched exactly and case-sensitively
    pub event: String,
    /// Optional payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl EventFrame {
    /// Create an event without payload
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: None,
        }
    }

    /// Create an event with a payload
    pub fn with_data(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data: Some(data),
        }
    }

    /// Parse and validate a frame received from a client
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let frame: Self = serde_json::from_str(json)?;
        frame.validate_inbound()?;
        Ok(frame)
    }

    /// Serialize the frame to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validate a frame coming from a client
    pub fn validate_inbound(&self) -> ProtocolResult<()> {
        if self.event.is_empty() {
            return Err(ProtocolError::ValidationError(
                "event name cannot be empty".to_string(),
            ));
        }
        if self.event.len() > MAX_EVENT_NAME_LENGTH {
            return Err(ProtocolError::ValidationError(format!(
                "event name exceeds maximum length of {} characters",
                MAX_EVENT_NAME_LENGTH
            )));
        }
        if events::RESERVED_INBOUND.contains(&self.event.as_str()) {
            return Err(ProtocolError::ValidationError(format!(
                "event name '{}' is reserved",
                self.event
            )));
        }
        Ok(())
    }

    /// `connect` event carrying the assigned connection id
    pub fn connected(id: &str) -> Self {
        Self::with_data(
            events::CONNECT,
            json!({ "id": id, "version": PROTOCOL_VERSION }),
        )
    }

    /// `pong` answer to a `ping`
    pub fn pong() -> Self {
        Self::new(events::PONG)
    }

    /// `error` event with code
    pub fn error(message: impl Into<String>, code: ErrorCode) -> Self {
        let message: String = message.into();
        Self::with_data(events::ERROR, json!({ "message": message, "code": code }))
    }

    /// `unavailable` event for work the backend did not accept
    pub fn unavailable(event: &str, reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        Self::with_data(
            events::UNAVAILABLE,
            json!({
                "event": event,
                "reason": reason,
                "code": ErrorCode::BackendUnavailable,
            }),
        )
    }
}

impl From<ProtocolError> for EventFrame {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::ValidationError(_) => ErrorCode::InvalidEvent,
        };
        EventFrame::error(err.to_string(), code)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_without_payload_omits_data() {
        let json = EventFrame::pong().to_json().unwrap();
        assert_eq!(json, r#"{"event":"pong"}"#);
    }

    #[test]
    fn test_frame_with_payload() {
        let frame = EventFrame::with_data("announce", json!({ "count": 2 }));
        let json = frame.to_json().unwrap();
        assert!(json.contains("\"event\":\"announce\""));
        assert!(json.contains("\"count\":2"));
    }

    #[test]
    fn test_parse_minimal_frame() {
        let frame = EventFrame::from_json(r#"{"event": "ping"}"#).unwrap();
        assert_eq!(frame.event, "ping");
        assert!(frame.data.is_none());
    }

    #[test]
    fn test_parse_frame_with_null_data() {
        let frame = EventFrame::from_json(r#"{"event": "ping", "data": null}"#).unwrap();
        assert!(frame.data.is_none());
    }

    #[test]
    fn test_event_names_are_case_sensitive() {
        let frame = EventFrame::from_json(r#"{"event": "Ping"}"#).unwrap();
        assert_ne!(frame.event, events::PING);
    }

    #[test]
    fn test_parse_invalid_json() {
        let result = EventFrame::from_json("not json");
        assert!(matches!(result, Err(ProtocolError::SerializationError(_))));
    }

    #[test]
    fn test_parse_missing_event() {
        let result = EventFrame::from_json(r#"{"data": 1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_event_name_rejected() {
        let result = EventFrame::from_json(r#"{"event": ""}"#);
        assert!(result.unwrap_err().to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_long_event_name_rejected() {
        let frame = EventFrame::new("x".repeat(MAX_EVENT_NAME_LENGTH + 1));
        let result = frame.validate_inbound();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("exceeds maximum length"));
    }

    #[test]
    fn test_reserved_inbound_names_rejected() {
        for name in events::RESERVED_INBOUND {
            let result = EventFrame::new(*name).validate_inbound();
            assert!(result.unwrap_err().to_string().contains("reserved"));
        }
    }

    #[test]
    fn test_connected_frame() {
        let frame = EventFrame::connected("abc");
        assert_eq!(frame.event, events::CONNECT);
        let data = frame.data.unwrap();
        assert_eq!(data["id"], "abc");
        assert_eq!(data["version"], PROTOCOL_VERSION);
    }

    #[test]
    fn test_unavailable_frame() {
        let frame = EventFrame::unavailable("score", "queue full");
        assert_eq!(frame.event, events::UNAVAILABLE);
        let data = frame.data.unwrap();
        assert_eq!(data["event"], "score");
        assert_eq!(data["reason"], "queue full");
        assert_eq!(data["code"], "backend_unavailable");
    }

    #[test]
    fn test_protocol_error_to_frame() {
        let err = ProtocolError::ValidationError("test error".to_string());
        let frame: EventFrame = err.into();

        assert_eq!(frame.event, events::ERROR);
        let data = frame.data.unwrap();
        assert!(data["message"].as_str().unwrap().contains("test error"));
        assert_eq!(data["code"], "invalid_event");
    }
}
