//! Per-connection WebSocket session.
//!
//! Each accepted connection runs as its own tokio task: upgrade
//! handshake, then a read/echo-write loop until the peer closes or an
//! operation fails. The steps are awaited in sequence, so at most one
//! I/O operation is ever outstanding for a connection and reads and
//! writes never interleave on the same stream.

use futures_util::{SinkExt, StreamExt};
use socket2::SockRef;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SERVER;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

/// Server identification advertised in the handshake response.
pub const SERVER_IDENT: &str = concat!("ws-echo/", env!("CARGO_PKG_VERSION"));

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Performing the WebSocket upgrade handshake.
    Handshaking,
    /// A read is outstanding, waiting for the next message.
    AwaitingMessage,
    /// Writing the echo of the message just received.
    Echoing,
    /// Terminal; no further operation is issued.
    Closed,
}

/// A single client session.
pub struct Session {
    peer: SocketAddr,
    state: SessionState,
}

impl Session {
    /// Create a new session in the initial handshaking state.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: SessionState::Handshaking,
        }
    }

    /// Current lifecycle state.
    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transition to waiting for the next inbound message.
    fn await_message(&mut self) {
        self.state = SessionState::AwaitingMessage;
    }

    /// Transition to writing an echo.
    fn start_echoing(&mut self) {
        self.state = SessionState::Echoing;
    }

    /// Mark the session terminal.
    fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Drive the session to completion.
    ///
    /// Returns `Ok(())` on clean termination (peer closed the
    /// connection); any handshake, read, or write failure tears the
    /// session down and is returned for the caller to report. Failures
    /// never affect other sessions.
    pub async fn run(mut self, stream: TcpStream) -> Result<(), SessionError> {
        // OS keep-alive defaults only; idle sessions are never
        // forcibly closed.
        SockRef::from(&stream)
            .set_keepalive(true)
            .map_err(SessionError::Socket)?;

        let mut ws = match accept_hdr_async(stream, decorate_response).await {
            Ok(ws) => ws,
            Err(e) => {
                self.close();
                return Err(SessionError::Handshake(e));
            }
        };
        self.await_message();
        trace!(peer = %self.peer, "Handshake complete");

        loop {
            let msg = match ws.next().await {
                Some(Ok(msg)) if msg.is_text() || msg.is_binary() => msg,

                // Peer closed the connection cleanly; this is normal
                // termination, not a failure.
                Some(Ok(Message::Close(_)))
                | Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed))
                | None => {
                    debug!(peer = %self.peer, "Connection closed by client");
                    self.close();
                    return Ok(());
                }

                // Pings are answered by the protocol layer; nothing to
                // echo for control frames.
                Some(Ok(_)) => continue,

                Some(Err(e)) => {
                    self.close();
                    return Err(SessionError::Read(e));
                }
            };

            self.start_echoing();
            trace!(
                peer = %self.peer,
                len = msg.len(),
                text = msg.is_text(),
                "Echoing message"
            );

            // Reply with the identical message: same payload bytes,
            // same frame type (text or binary).
            if let Err(e) = ws.send(msg).await {
                self.close();
                return Err(SessionError::Write(e));
            }
            self.await_message();
        }
    }
}

/// Set the Server header on the 101 handshake response.
fn decorate_response(_req: &Request, mut resp: Response) -> Result<Response, ErrorResponse> {
    resp.headers_mut()
        .insert(SERVER, HeaderValue::from_static(SERVER_IDENT));
    Ok(resp)
}

/// Reasons a session terminated abnormally, tagged with the operation
/// that failed.
#[derive(Debug)]
pub enum SessionError {
    /// Socket option setup failed before the handshake.
    Socket(std::io::Error),
    /// The WebSocket upgrade handshake failed.
    Handshake(WsError),
    /// A read failed for a reason other than a clean close.
    Read(WsError),
    /// An echo write failed.
    Write(WsError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Socket(e) => write!(f, "socket setup: {e}"),
            SessionError::Handshake(e) => write!(f, "handshake: {e}"),
            SessionError::Read(e) => write!(f, "read: {e}"),
            SessionError::Write(e) => write!(f, "write: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}
