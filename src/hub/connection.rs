//! One display client: its registry entry, socket handshake and the two loops
//! that serve it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::client::Context;
use crate::error::BridgeError;

pub type ConnId = u64;

pub const READY_TEXT: &str = "Voice bridge is running. Use a WebSocket connection to connect.";

pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const SEND_TIMEOUT: Duration = Duration::from_secs(1);

const PEEK_BUFFER: usize = 4096;
const PEEK_INTERVAL: Duration = Duration::from_millis(10);

/// Registry handle for one display client. Cloning it is cheap; all clones feed
/// the same outbound queue, which the connection's writer drains in order.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub id: ConnId,
    pub peer: SocketAddr,
    outbound: mpsc::UnboundedSender<WsMessage>,
}

impl ClientConnection {
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue a frame. Fails once the writer has stopped.
    pub fn send(&self, msg: WsMessage) -> Result<(), BridgeError> {
        self.outbound
            .send(msg)
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    pub fn close(&self, reason: &'static str) -> Result<(), BridgeError> {
        self.send(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        })))
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnId, ClientConnection>,
    next_id: ConnId,
}

impl Registry {
    pub fn register(
        &mut self,
        peer: SocketAddr,
    ) -> (ClientConnection, mpsc::UnboundedReceiver<WsMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        self.next_id += 1;
        let conn = ClientConnection {
            id: self.next_id,
            peer,
            outbound,
        };
        self.connections.insert(conn.id, conn.clone());
        (conn, rx)
    }

    pub fn remove(&mut self, id: ConnId) -> Option<ClientConnection> {
        self.connections.remove(&id)
    }

    pub fn snapshot(&self) -> Vec<ClientConnection> {
        self.connections.values().cloned().collect()
    }

    pub fn drain(&mut self) -> Vec<ClientConnection> {
        self.connections.drain().map(|(_, conn)| conn).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Upgrade,
    Plain,
    Closed,
}

/// Look at the request head without consuming it, so the WebSocket handshake
/// can still read it afterwards.
pub(crate) async fn classify(stream: &TcpStream) -> RequestKind {
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut buf = vec![0u8; PEEK_BUFFER];

    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return RequestKind::Closed,
            Ok(Ok(n)) => n,
        };

        let head = &buf[..n];
        let complete = head.windows(4).any(|w| w == b"\r\n\r\n");
        if complete || n == buf.len() {
            let head = String::from_utf8_lossy(head).to_ascii_lowercase();
            return if head.contains("upgrade: websocket") {
                RequestKind::Upgrade
            } else {
                RequestKind::Plain
            };
        }

        if Instant::now() >= deadline {
            return RequestKind::Closed;
        }
        tokio::time::sleep(PEEK_INTERVAL).await;
    }
}

pub(crate) async fn respond_plain(mut stream: TcpStream, peer: SocketAddr) {
    let mut discard = vec![0u8; PEEK_BUFFER];
    let _ = stream.read(&mut discard).await;

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        READY_TEXT.len(),
        READY_TEXT
    );
    let written = tokio::time::timeout(SEND_TIMEOUT, async {
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    })
    .await;

    match written {
        Ok(Ok(())) => debug!("Responded to plain HTTP request from {}", peer),
        Ok(Err(e)) => debug!("Failed to answer plain HTTP request from {}: {}", peer, e),
        Err(_) => debug!("Timed out answering plain HTTP request from {}", peer),
    }
}

/// Drain the connection's queue into its socket. Each write is bounded so a dead
/// peer can never wedge shutdown.
pub(crate) async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut rx: mpsc::UnboundedReceiver<WsMessage>,
    peer: SocketAddr,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, WsMessage::Close(_));
        match tokio::time::timeout(SEND_TIMEOUT, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Failed to send to {}: {}", peer, e);
                break;
            }
            Err(_) => {
                warn!("Timed out sending to {}", peer);
                break;
            }
        }
        if closing {
            break;
        }
    }
    rx.close();
    let _ = tokio::time::timeout(SEND_TIMEOUT, sink.close()).await;
}

/// Read text commands until the client closes, the socket fails or the hub stops.
pub(crate) async fn read_loop(
    ctx: &Context,
    conn: &ClientConnection,
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    cancel: &CancellationToken,
) {
    debug!("Starting message loop for client {}", conn.peer);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(WsMessage::Text(text))) => {
                debug!("Received message from {}: {}", conn.peer, text.as_str());
                route_command(ctx, conn, text.as_str()).await;
            }
            Some(Ok(WsMessage::Close(frame))) => {
                info!("Received close message from {}: {:?}", conn.peer, frame);
                break;
            }
            Some(Ok(WsMessage::Binary(data))) => {
                info!("Ignoring binary message ({} bytes) from {}", data.len(), conn.peer);
            }
            Some(Ok(other)) => debug!("Ignoring control frame from {}: {:?}", conn.peer, other),
            Some(Err(e)) => {
                warn!("Error reading from {}: {}", conn.peer, e);
                break;
            }
            None => break,
        }
    }
}

async fn route_command(ctx: &Context, conn: &ClientConnection, command: &str) {
    let result = match command {
        "mute" => ctx.toggle_mute().await,
        "deafen" => ctx.toggle_deafen().await,
        "leaveChannel" => ctx.leave_channel().await,
        "getInitialState" => {
            let reply = ctx.initial_state().await;
            match reply.to_json() {
                Ok(json) => conn.send(WsMessage::Text(json.into())),
                Err(e) => Err(e.into()),
            }
        }
        other => {
            info!("Unknown command from {}: {}", conn.peer, other);
            Ok(())
        }
    };

    match result {
        Ok(()) => {}
        Err(BridgeError::StateUnavailable) => {
            info!("Voice settings not available yet, ignoring {}", command)
        }
        Err(e) => warn!("Error processing command '{}' from {}: {}", command, conn.peer, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn ids_are_unique_and_removal_is_exact() {
        let mut registry = Registry::default();
        let (a, _rx_a) = registry.register(peer());
        let (b, _rx_b) = registry.register(peer());
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(a.id).is_some());
        assert!(registry.remove(a.id).is_none());
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(registry.snapshot()[0].id, b.id);
    }

    #[test]
    fn closed_writer_makes_sends_fail() {
        let mut registry = Registry::default();
        let (conn, rx) = registry.register(peer());
        assert!(conn.is_open());
        drop(rx);
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send(WsMessage::Text("x".into())),
            Err(BridgeError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn initial_state_is_sent_only_to_requester() {
        let ctx = Context::new();
        let mut registry = Registry::default();
        let (requester, mut rx_requester) = registry.register(peer());
        let (_other, mut rx_other) = registry.register(peer());

        route_command(&ctx, &requester, "getInitialState").await;

        match rx_requester.try_recv().unwrap() {
            WsMessage::Text(text) => assert_eq!(text.as_str(), r#"{"cmd":"STATE_UNAVAILABLE"}"#),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_and_premature_commands_send_nothing() {
        let ctx = Context::new();
        let mut registry = Registry::default();
        let (conn, mut rx) = registry.register(peer());

        for command in ["mute", "deafen", "leaveChannel", "MUTE", "hello"] {
            route_command(&ctx, &conn, command).await;
        }
        assert!(rx.try_recv().is_err());
    }
}
