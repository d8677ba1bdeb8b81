//! Proxy configuration
//!
//! Loads the JSON configuration file: listen port, route table and limits.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::Uri;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Errors that can occur while loading the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Duplicate route for path '{0}'")]
    DuplicateRoute(String),
    #[error("Invalid backend URL '{url}' for path '{path}': {reason}")]
    InvalidBackend {
        path: String,
        url: String,
        reason: String,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Proxy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// TCP port to listen on
    pub listen_port: u16,
    /// Request path to backend WebSocket URL, in file order.
    ///
    /// Kept as a list so a key repeated in the JSON object is still seen
    /// (and rejected) when the routing table is built.
    #[serde(deserialize_with = "deserialize_services")]
    pub services: Vec<(String, String)>,
    /// Address to bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum number of concurrent sessions (unlimited when absent)
    #[serde(default)]
    pub max_sessions: Option<usize>,
    /// Backend dial and handshake timeout
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_dial_timeout_secs() -> u64 {
    45
}

impl ProxyConfig {
    /// Load and validate configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Backend dial timeout as a `Duration`
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == Some(0) {
            return Err(ConfigError::Invalid(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        if self.dial_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "dial_timeout_secs must be at least 1".to_string(),
            ));
        }

        for (path, url) in &self.services {
            validate_backend_url(url).map_err(|reason| ConfigError::InvalidBackend {
                path: path.clone(),
                url: url.clone(),
                reason,
            })?;
        }
        Ok(())
    }
}

/// Only plain `ws://` backends with a host are supported
fn validate_backend_url(url: &str) -> Result<(), String> {
    let uri: Uri = url.parse().map_err(|e| format!("{}", e))?;

    match uri.scheme_str() {
        Some("ws") => {}
        Some("wss") => return Err("wss:// backends are not supported".to_string()),
        Some(other) => return Err(format!("unsupported scheme '{}'", other)),
        None => return Err("missing scheme".to_string()),
    }

    if uri.host().is_none() {
        return Err("missing host".to_string());
    }
    Ok(())
}

fn deserialize_services<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ServicesVisitor;

    impl<'de> Visitor<'de> for ServicesVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of request path to backend URL")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut services = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((path, url)) = map.next_entry::<String, String>()? {
                services.push((path, url));
            }
            Ok(services)
        }
    }

    deserializer.deserialize_map(ServicesVisitor)
}
