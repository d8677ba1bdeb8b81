//! Configuration module
//!
//! Handles loading the proxy configuration file.

mod proxy;

pub use proxy::*;
