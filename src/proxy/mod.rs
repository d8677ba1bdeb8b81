//! WebSocket proxy module
//!
//! Brokers inbound upgrade requests to their backends and relays frames
//! between the two sides for the lifetime of each session.

mod broker;
mod error;
mod frame;
mod relay;
mod session;
mod supervisor;

pub use broker::{create_router, ProxyState};
pub use supervisor::SessionSupervisor;
