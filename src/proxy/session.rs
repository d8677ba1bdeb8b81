//! A single proxied session
//!
//! Pairs one upgraded client socket with one backend socket. The session owns
//! both exclusively; nothing outside its two relay loops touches them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::supervisor::Admission;

/// Backend side of a session
pub type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Coordinated close signal shared by both directions of a session.
///
/// The first `close` cancels the session; later calls are no-ops.
#[derive(Debug, Clone)]
pub struct Teardown {
    token: CancellationToken,
    initiated: Arc<AtomicBool>,
}

impl Teardown {
    /// Create a teardown that also fires when `parent` is cancelled
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Tear the session down. Returns `true` only for the call that did it.
    pub fn close(&self) -> bool {
        if self.initiated.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Whether the session has been torn down, by either direction or by shutdown
    #[allow(dead_code)]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the session is torn down
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// A live client/backend pairing, ready to be relayed
pub struct Session {
    pub(crate) id: Uuid,
    pub(crate) path: String,
    pub(crate) backend_url: String,
    pub(crate) client: WebSocket,
    pub(crate) backend: BackendStream,
    pub(crate) admission: Admission,
}

impl Session {
    /// Pair an upgraded client with its dialed backend
    pub fn new(
        path: impl Into<String>,
        backend_url: impl Into<String>,
        client: WebSocket,
        backend: BackendStream,
        admission: Admission,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            backend_url: backend_url.into(),
            client,
            backend,
            admission,
        }
    }
}
