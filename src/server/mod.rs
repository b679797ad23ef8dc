//! WebSocket server module
//!
//! Accepts client connections on a single port: plain HTTP for the health
//! check, WebSocket upgrades for the event channel.

mod protocol;
mod websocket;

pub use protocol::*;
pub use websocket::*;
