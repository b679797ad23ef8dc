//! Real-time WebSocket event gateway.
//!
//! Clients connect over WebSocket and exchange named JSON events with the
//! gateway. Work that needs the computation worker is handed to a
//! [`backend::Backend`] and its results are routed back to one connection or
//! broadcast to all of them.
//!
//! ## Architecture
//!
//! ```text
//! axum listener (/health, WebSocket upgrade)
//!         ↓
//! connection tasks ──commands──▶ Gateway loop (Dispatcher + Registry)
//!                                        ↓            ↑
//!                                  Backend::submit   ResultSink
//! ```

pub mod backend;
pub mod config;
pub mod gateway;
pub mod server;

pub use backend::{Backend, BackendSettings, EchoProcessor, LocalWorker};
pub use config::{GatewayConfig, Overrides, CONFIG_FILE};
pub use gateway::{Gateway, GatewayHandle};
pub use server::{ServerConfig, WebSocketServer};
