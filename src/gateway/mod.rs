//! Connection gateway
//!
//! Connection registry, per-connection event dispatch, and the single loop
//! that owns them both.

mod dispatcher;
mod event_loop;
pub mod handlers;
mod registry;

pub use dispatcher::*;
pub use event_loop::*;
pub use registry::*;
