//! Connection broker
//!
//! Handles each inbound request: resolve the route, dial the backend, and only
//! then upgrade the client. A client is never told it is connected when the
//! backend is unreachable.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        State,
    },
    http::Uri,
    response::{IntoResponse, Response},
    Router,
};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, warn};

use super::error::{ProxyError, ProxyResult};
use super::session::{BackendStream, Session};
use super::supervisor::SessionSupervisor;
use crate::routing::RoutingTable;

/// Shared state for the proxy handler
pub struct ProxyState {
    pub routes: RoutingTable,
    pub supervisor: SessionSupervisor,
    pub dial_timeout: Duration,
}

/// Catch-all router: every path goes through the broker
pub fn create_router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(proxy_handler).with_state(state)
}

/// Dial a backend WebSocket, bounded by `timeout`
pub async fn dial(url: &str, timeout: Duration) -> ProxyResult<BackendStream> {
    debug!("Connecting to backend {}", url);
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::BackendUnreachable {
            url: url.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(ProxyError::BackendUnreachable {
            url: url.to_string(),
            reason: format!("timed out after {:?}", timeout),
        }),
    }
}

async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    uri: Uri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let path = uri.path();

    let Some(backend_url) = state.routes.lookup(path) else {
        warn!("No route for {}", path);
        return ProxyError::RouteNotFound(path.to_string()).into_response();
    };
    debug!("Proxy request: {} -> {}", path, backend_url);

    let admission = match state.supervisor.try_admit() {
        Ok(admission) => admission,
        Err(e) => {
            warn!("Rejecting {}: {}", path, e);
            return e.into_response();
        }
    };

    let shutdown = state.supervisor.shutdown_token();
    let dialed = tokio::select! {
        _ = shutdown.cancelled() => Err(ProxyError::ShuttingDown),
        dialed = dial(backend_url, state.dial_timeout) => dialed,
    };
    let mut backend = match dialed {
        Ok(backend) => backend,
        Err(e) => {
            error!("{} (path {})", e, path);
            return e.into_response();
        }
    };

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            error!(
                "Client upgrade failed for {} (backend {}): {}",
                path,
                backend_url,
                rejection.body_text()
            );
            if let Err(e) = backend.close(None).await {
                debug!("Backend close for {}: {}", backend_url, e);
            }
            return rejection.into_response();
        }
    };

    let path = path.to_string();
    let backend_url = backend_url.to_string();
    let supervisor = state.supervisor.clone();
    let failed_path = path.clone();

    ws.on_failed_upgrade(move |e| {
        error!("Client upgrade failed for {}: {}", failed_path, e);
    })
    .on_upgrade(move |client| async move {
        let session = Session::new(path, backend_url, client, backend, admission);
        supervisor.run(session).await;
    })
}
