//! WebSocket proxy server
//!
//! Binds the listening socket and serves the connection broker until the
//! supervisor signals shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::proxy::{create_router, ProxyState, SessionSupervisor};
use crate::routing::RoutingTable;

/// Default backend dial timeout
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(45);

/// Configuration for the proxy server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Backend dial and handshake timeout
    pub dial_timeout: Duration,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// Set the backend dial timeout
    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Path-routing WebSocket proxy server
pub struct ProxyServer {
    config: ServerConfig,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ServerConfig, routes: RoutingTable, supervisor: SessionSupervisor) -> Self {
        let state = Arc::new(ProxyState {
            routes,
            supervisor,
            dial_timeout: config.dial_timeout,
        });
        Self { config, state }
    }

    /// Supervisor owning this server's sessions
    #[allow(dead_code)]
    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.state.supervisor
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        self.state.supervisor.shutdown();
    }

    /// Run the proxy server
    ///
    /// Serves until shutdown is triggered. Live sessions are torn down by the
    /// supervisor; waiting for them is the caller's job.
    pub async fn run(&self) -> anyhow::Result<()> {
        let (_addr, handle) = self.listen().await?;
        handle.await?;
        Ok(())
    }

    /// Bind and serve in the background, returning the bound address
    pub async fn listen(&self) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        let addr = listener.local_addr()?;
        info!("WebSocket proxy listening on ws://{}", addr);

        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            if let Err(e) = serve(listener, state).await {
                error!("Proxy server error: {}", e);
            }
        });
        Ok((addr, handle))
    }
}

async fn serve(listener: TcpListener, state: Arc<ProxyState>) -> anyhow::Result<()> {
    let shutdown = state.supervisor.shutdown_token();
    let app = create_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("Proxy server stopped accepting connections");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::{accept_async, connect_async};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Backend that echoes every data frame and counts accepted TCP connections
    async fn spawn_echo_backend() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        (addr, accepted)
    }

    /// Backend that closes the connection after its first message
    async fn spawn_closing_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            let _ = ws.close(None).await;
            while let Some(Ok(_)) = ws.next().await {}
        });

        addr
    }

    /// Backend that completes the handshake and then never reads
    async fn spawn_stalled_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = accept_async(stream).await.unwrap();
            std::future::pending::<()>().await;
        });

        addr
    }

    /// Backend that accepts TCP but never answers the handshake
    async fn spawn_silent_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        addr
    }

    /// Address nothing is listening on
    async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn start_proxy(
        routes: Vec<(&str, SocketAddr)>,
        max_sessions: Option<usize>,
    ) -> (SocketAddr, ProxyServer) {
        start_proxy_with_dial_timeout(routes, max_sessions, TIMEOUT).await
    }

    async fn start_proxy_with_dial_timeout(
        routes: Vec<(&str, SocketAddr)>,
        max_sessions: Option<usize>,
        dial_timeout: Duration,
    ) -> (SocketAddr, ProxyServer) {
        let routes = RoutingTable::load(
            routes
                .into_iter()
                .map(|(path, addr)| (path, format!("ws://{}", addr))),
        )
        .unwrap();
        let config = ServerConfig::new("127.0.0.1", 0).with_dial_timeout(dial_timeout);
        let server = ProxyServer::new(config, routes, SessionSupervisor::new(max_sessions));
        let (addr, _handle) = server.listen().await.unwrap();
        (addr, server)
    }

    fn rejected_status(result: Result<impl std::fmt::Debug, WsError>) -> u16 {
        match result {
            Err(WsError::Http(response)) => response.status().as_u16(),
            other => panic!("Expected HTTP rejection, got {:?}", other),
        }
    }

    async fn wait_for_idle(server: &ProxyServer) {
        timeout(TIMEOUT, async {
            while server.supervisor().active_sessions() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sessions did not finish");
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1", 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.dial_timeout, DEFAULT_DIAL_TIMEOUT);
    }

    #[test]
    fn test_server_config_with_dial_timeout() {
        let config =
            ServerConfig::new("0.0.0.0", 8080).with_dial_timeout(Duration::from_secs(2));
        assert_eq!(config.dial_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_echo_through_proxy() {
        let (backend, _) = spawn_echo_backend().await;
        let (proxy, _server) = start_proxy(vec![("/a", backend)], None).await;

        let (mut client, _) = connect_async(format!("ws://{}/a", proxy)).await.unwrap();
        client.send(Message::Text("ping".into())).await.unwrap();

        let reply = timeout(TIMEOUT, client.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(reply, Message::Text("ping".into()));
    }

    #[tokio::test]
    async fn test_binary_frames_stay_binary() {
        let (backend, _) = spawn_echo_backend().await;
        let (proxy, _server) = start_proxy(vec![("/a", backend)], None).await;

        let (mut client, _) = connect_async(format!("ws://{}/a/", proxy)).await.unwrap();
        let payload = vec![0u8, 1, 2, 254, 255];
        client
            .send(Message::Binary(payload.clone().into()))
            .await
            .unwrap();

        let reply = timeout(TIMEOUT, client.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(reply, Message::Binary(payload.into()));
    }

    #[tokio::test]
    async fn test_order_preserved_within_direction() {
        let (backend, _) = spawn_echo_backend().await;
        let (proxy, _server) = start_proxy(vec![("/a", backend)], None).await;

        let (mut client, _) = connect_async(format!("ws://{}/a", proxy)).await.unwrap();
        for i in 0..20 {
            client.send(Message::Text(i.to_string().into())).await.unwrap();
        }
        for i in 0..20 {
            let reply = timeout(TIMEOUT, client.next()).await.unwrap().unwrap().unwrap();
            assert_eq!(reply, Message::Text(i.to_string().into()));
        }
    }

    #[tokio::test]
    async fn test_unknown_path_is_404_without_dialing() {
        let (backend, accepted) = spawn_echo_backend().await;
        let (proxy, _server) = start_proxy(vec![("/a", backend)], None).await;

        let result = connect_async(format!("ws://{}/missing", proxy)).await;
        assert_eq!(rejected_status(result), 404);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_502() {
        let down = unused_addr().await;
        let (proxy, server) = start_proxy(vec![("/down", down)], None).await;

        let result = connect_async(format!("ws://{}/down", proxy)).await;
        assert_eq!(rejected_status(result), 502);
        wait_for_idle(&server).await;
    }

    #[tokio::test]
    async fn test_backend_handshake_timeout_is_502() {
        let silent = spawn_silent_backend().await;
        let (proxy, server) =
            start_proxy_with_dial_timeout(vec![("/slow", silent)], None, Duration::from_millis(200))
                .await;

        let result = timeout(TIMEOUT, connect_async(format!("ws://{}/slow", proxy)))
            .await
            .expect("dial timeout was not applied");
        assert_eq!(rejected_status(result), 502);
        wait_for_idle(&server).await;
        assert_eq!(server.supervisor().active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_plain_http_to_matched_path_fails_at_upgrade() {
        let (backend, accepted) = spawn_echo_backend().await;
        let (proxy, server) = start_proxy(vec![("/a", backend)], None).await;

        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream
            .write_all(b"GET /a HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        timeout(TIMEOUT, stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();

        assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        wait_for_idle(&server).await;
    }

    #[tokio::test]
    async fn test_backend_close_propagates_to_client() {
        let backend = spawn_closing_backend().await;
        let (proxy, server) = start_proxy(vec![("/a", backend)], None).await;

        let (mut client, _) = connect_async(format!("ws://{}/a", proxy)).await.unwrap();
        client.send(Message::Text("hi".into())).await.unwrap();

        timeout(TIMEOUT, async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Text(t))) => panic!("unexpected frame relayed: {}", t),
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .expect("client was not closed");

        wait_for_idle(&server).await;
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let (backend_a, _) = spawn_echo_backend().await;
        let (backend_b, _) = spawn_echo_backend().await;
        let (proxy, _server) =
            start_proxy(vec![("/a", backend_a), ("/b", backend_b)], None).await;

        let (mut a, _) = connect_async(format!("ws://{}/a", proxy)).await.unwrap();
        let (mut b, _) = connect_async(format!("ws://{}/b", proxy)).await.unwrap();

        a.send(Message::Text("from a".into())).await.unwrap();
        let reply = timeout(TIMEOUT, a.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(reply, Message::Text("from a".into()));

        a.close(None).await.unwrap();

        b.send(Message::Text("still here".into())).await.unwrap();
        let reply = timeout(TIMEOUT, b.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(reply, Message::Text("still here".into()));
    }

    #[tokio::test]
    async fn test_session_limit() {
        let (backend, _) = spawn_echo_backend().await;
        let (proxy, server) = start_proxy(vec![("/a", backend)], Some(1)).await;
        let url = format!("ws://{}/a", proxy);

        let (mut first, _) = connect_async(url.as_str()).await.unwrap();
        first.send(Message::Text("one".into())).await.unwrap();
        timeout(TIMEOUT, first.next()).await.unwrap().unwrap().unwrap();

        assert_eq!(rejected_status(connect_async(url.as_str()).await), 503);

        first.close(None).await.unwrap();
        wait_for_idle(&server).await;

        let (mut again, _) = connect_async(url.as_str()).await.unwrap();
        again.send(Message::Text("two".into())).await.unwrap();
        let reply = timeout(TIMEOUT, again.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(reply, Message::Text("two".into()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_live_sessions() {
        let (backend, _) = spawn_echo_backend().await;
        let (proxy, server) = start_proxy(vec![("/a", backend)], None).await;

        let (mut client, _) = connect_async(format!("ws://{}/a", proxy)).await.unwrap();
        client.send(Message::Text("x".into())).await.unwrap();
        timeout(TIMEOUT, client.next()).await.unwrap().unwrap().unwrap();

        server.shutdown();
        server.shutdown();

        timeout(TIMEOUT, async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .expect("client was not closed on shutdown");

        assert!(server.supervisor().drain(TIMEOUT).await);
    }

    #[tokio::test]
    async fn test_shutdown_drains_session_with_stalled_backend() {
        let backend = spawn_stalled_backend().await;
        let (proxy, server) = start_proxy(vec![("/a", backend)], None).await;

        let (mut client, _) = connect_async(format!("ws://{}/a", proxy)).await.unwrap();
        let frame = Message::Binary(vec![0u8; 1024 * 1024].into());

        // Keep writing until the backend's buffers are full and the relay is stuck
        let _ = timeout(Duration::from_secs(2), async {
            while client.send(frame.clone()).await.is_ok() {}
        })
        .await;
        assert_eq!(server.supervisor().active_sessions(), 1);

        server.shutdown();
        assert!(server.supervisor().drain(TIMEOUT).await);
        assert_eq!(server.supervisor().active_sessions(), 0);
    }
}
