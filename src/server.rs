//! TCP listener and accept loop for WebSocket connections.
//!
//! Owns the listening socket and hands every accepted connection to
//! its own session task. A failure on one connection never reaches the
//! listener or any other connection.

use crate::config::Config;
use crate::session::Session;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Listen backlog requested from the kernel.
const LISTEN_BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    live_connections: Arc<AtomicUsize>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Server {
            config,
            live_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Open, bind, and listen on the configured address.
    ///
    /// Fails when the address is already in use or the port needs
    /// privileges the process lacks; no accept loop runs in that case.
    pub fn bind(&self) -> std::io::Result<TcpListener> {
        let ip: IpAddr = self
            .config
            .host
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let addr = SocketAddr::new(ip, self.config.port);

        let socket = Socket::new(
            match addr {
                SocketAddr::V4(_) => Domain::IPV4,
                SocketAddr::V6(_) => Domain::IPV6,
            },
            Type::STREAM,
            Some(Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        TcpListener::from_std(socket.into())
    }

    /// Bind and accept connections until the process is terminated.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind()?;
        info!(address = %listener.local_addr()?, "Server listening");
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections forever.
    ///
    /// Every iteration re-arms the next accept regardless of whether
    /// the previous attempt succeeded; a peer resetting before its
    /// handshake never stops the listener. Each accepted connection
    /// gets its own spawned task, so sessions make progress
    /// independently while each session's own operations stay ordered.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "New connection");
                    let guard = ConnGuard::register(&self.live_connections);

                    tokio::spawn(async move {
                        if let Err(e) = Session::new(peer).run(stream).await {
                            warn!(%peer, error = %e, "Session failed");
                        }
                        drop(guard);
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Number of sessions currently alive (observability only).
    #[cfg(test)]
    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::SeqCst)
    }
}

/// Counts a session for as long as its task owns this guard.
struct ConnGuard(Arc<AtomicUsize>);

impl ConnGuard {
    fn register(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        ConnGuard(Arc::clone(counter))
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{client_async, WebSocketStream};

    fn test_config(port: u16) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port,
            workers: 1,
            log_level: "info".to_string(),
        }
    }

    /// Bind a server on an ephemeral port and start serving.
    async fn start_server() -> (Arc<Server>, SocketAddr) {
        let server = Arc::new(Server::new(test_config(0)));
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();

        let srv = Arc::clone(&server);
        tokio::spawn(async move { srv.serve(listener).await });

        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> WebSocketStream<TcpStream> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (ws, _) = client_async(format!("ws://{addr}"), stream).await.unwrap();
        ws
    }

    async fn echo_roundtrip(ws: &mut WebSocketStream<TcpStream>, text: &str) {
        ws.send(Message::text(text)).await.unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        assert_eq!(reply.into_text().unwrap().as_str(), text);
    }

    /// Poll until the live-connection count reaches `expected`.
    async fn wait_for_count(server: &Server, expected: usize) {
        for _ in 0..100 {
            if server.live_connections() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "live connection count never reached {expected}, still {}",
            server.live_connections()
        );
    }

    #[tokio::test]
    async fn test_bind_failure_when_address_in_use() {
        let (_server, addr) = start_server().await;

        let second = Server::new(test_config(addr.port()));
        let result = second.bind();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_independent_connections() {
        let (_server, addr) = start_server().await;

        // A sends but never reads its echo
        let mut slow = connect(addr).await;
        slow.send(Message::text("stalled")).await.unwrap();

        // B still gets echoed promptly
        let mut fast = connect(addr).await;
        echo_roundtrip(&mut fast, "prompt").await;

        // A's echo was not lost either
        let reply = slow.next().await.unwrap().unwrap();
        assert_eq!(reply.into_text().unwrap().as_str(), "stalled");
    }

    #[tokio::test]
    async fn test_listener_survives_bad_connection() {
        use tokio::io::AsyncWriteExt;

        let (_server, addr) = start_server().await;

        // Connection that dies before completing a handshake
        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"not a websocket handshake\r\n").await.unwrap();
        drop(bad);

        // The listener keeps serving well-behaved clients
        let mut ws = connect(addr).await;
        echo_roundtrip(&mut ws, "still alive").await;
    }

    #[tokio::test]
    async fn test_clean_close_releases_session() {
        let (server, addr) = start_server().await;

        let mut ws = connect(addr).await;
        wait_for_count(&server, 1).await;

        echo_roundtrip(&mut ws, "ping").await;
        ws.close(None).await.unwrap();

        wait_for_count(&server, 0).await;
    }

    #[tokio::test]
    async fn test_close_of_one_connection_leaves_others_running() {
        let (server, addr) = start_server().await;

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        wait_for_count(&server, 2).await;

        a.close(None).await.unwrap();
        wait_for_count(&server, 1).await;

        echo_roundtrip(&mut b, "unaffected").await;
    }
}
