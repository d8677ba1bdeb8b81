//! WebSocket server module
//!
//! Binds the listener and serves proxied WebSocket sessions.

mod websocket;

pub use websocket::*;
