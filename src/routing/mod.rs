//! Request routing module
//!
//! Resolves inbound request paths to backend WebSocket endpoints.

mod table;

pub use table::*;
