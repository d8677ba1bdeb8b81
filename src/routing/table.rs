//! Static path routing table
//!
//! Maps a normalized request path to the backend WebSocket URL that serves it.
//! Built once at startup and never mutated, so lookups need no locking.

use std::collections::HashMap;

use crate::config::ConfigError;

/// Strip every trailing slash. `/` normalizes to the empty path.
pub fn normalize_path(path: &str) -> &str {
    path.trim_end_matches('/')
}

/// Immutable mapping from normalized path to backend URL
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, String>,
}

impl RoutingTable {
    /// Build the table from `(path, backend_url)` entries.
    ///
    /// Fails if two entries normalize to the same path.
    pub fn load<I, P, U>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (P, U)>,
        P: AsRef<str>,
        U: Into<String>,
    {
        let mut routes = HashMap::new();
        for (path, url) in entries {
            let key = normalize_path(path.as_ref()).to_string();
            if routes.contains_key(&key) {
                return Err(ConfigError::DuplicateRoute(path.as_ref().to_string()));
            }
            routes.insert(key, url.into());
        }
        Ok(Self { routes })
    }

    /// Resolve a request path to its backend URL
    pub fn lookup(&self, path: &str) -> Option<&str> {
        self.routes.get(normalize_path(path)).map(String::as_str)
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no routes
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Iterate over `(normalized_path, backend_url)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes.iter().map(|(p, u)| (p.as_str(), u.as_str()))
    }
}
