//! Configuration module
//!
//! Handles loading the gateway configuration file and applying overrides.

mod gateway;

pub use gateway::*;
