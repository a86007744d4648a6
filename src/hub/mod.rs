//! Downstream WebSocket server for display clients.
//!
//! The hub owns the listener, the registry of open connections and every task
//! serving them. Notifications from the upstream client arrive through its
//! [`NotificationSink`] impl and are fanned out to every open connection; text
//! commands from a connection are routed to the shared [`Context`].

pub mod connection;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::Context;
use crate::error::BridgeError;
use crate::event::{Notification, NotificationSink};
use crate::reconnect::Reconnector;

use self::connection::{
    classify, read_loop, respond_plain, write_loop, Registry, RequestKind, HANDSHAKE_TIMEOUT,
};

pub const DEFAULT_PORT: u16 = 5983;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BindScope {
    /// Loopback only.
    Local,
    /// Every interface, so devices on the LAN can connect.
    #[default]
    All,
}

impl BindScope {
    pub fn ip(self) -> IpAddr {
        match self {
            BindScope::Local => IpAddr::V4(Ipv4Addr::LOCALHOST),
            BindScope::All => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

struct Shared {
    ctx: Context,
    registry: RwLock<Registry>,
    reconnector: Reconnector,
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

pub struct BroadcastHub {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl BroadcastHub {
    pub fn new(ctx: Context, reconnector: Reconnector) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx,
                registry: RwLock::new(Registry::default()),
                reconnector,
            }),
            running: Mutex::new(None),
        }
    }

    /// Bind and start accepting. A second call while running returns the
    /// existing address without opening another listener.
    pub async fn start(&self, port: u16, scope: BindScope) -> Result<SocketAddr, BridgeError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            info!("Server already running on {}, ignoring start request", current.local_addr);
            return Ok(current.local_addr);
        }

        let listener = TcpListener::bind((scope.ip(), port)).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(accept_loop(
            self.shared.clone(),
            listener,
            cancel.clone(),
            tracker.clone(),
        ));
        info!("WebSocket server listening on {}", local_addr);

        *running = Some(Running {
            cancel,
            tracker,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Close every connection with a normal-closure frame and release the
    /// listener. Safe to call when not running.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            debug!("Server not running, ignoring stop request");
            return;
        };

        info!("Stopping WebSocket server...");
        running.cancel.cancel();

        let connections = self.shared.registry.write().await.drain();
        info!("Closing {} client connection(s)", connections.len());
        for conn in &connections {
            if let Err(e) = conn.close("Server shutting down") {
                debug!("Connection {} already gone: {}", conn.peer, e);
            }
        }
        drop(connections);

        running.tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, running.tracker.wait())
            .await
            .is_err()
        {
            warn!("Timed out waiting for connection tasks to finish");
        }
        info!("WebSocket server stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    pub async fn connection_count(&self) -> usize {
        self.shared.registry.read().await.len()
    }

    /// Send `notification` to every open connection. Returns how many accepted it.
    ///
    /// Works on a snapshot of the registry; connections that turn out to be closed
    /// are pruned once the sweep is done.
    pub async fn broadcast(&self, notification: &Notification) -> usize {
        let connections = self.shared.registry.read().await.snapshot();
        if connections.is_empty() {
            debug!("No clients connected, dropping {:?}", notification);
            return 0;
        }

        let text = match notification.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode notification: {}", e);
                return 0;
            }
        };
        debug!("Broadcasting to {} client(s): {}", connections.len(), text);

        let mut dead = Vec::new();
        let mut delivered = 0;
        for conn in &connections {
            if !conn.is_open() {
                dead.push(conn.id);
                continue;
            }
            match conn.send(WsMessage::Text(text.clone().into())) {
                Ok(()) => delivered += 1,
                Err(_) => dead.push(conn.id),
            }
        }

        if !dead.is_empty() {
            let mut registry = self.shared.registry.write().await;
            for id in &dead {
                registry.remove(*id);
            }
            info!(
                "Removed {} dead connection(s), {} remaining",
                dead.len(),
                registry.len()
            );
        }
        delivered
    }
}

#[async_trait]
impl NotificationSink for BroadcastHub {
    async fn notify(&self, notification: Notification) {
        self.broadcast(&notification).await;
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Incoming connection from {}", peer);
                tracker.spawn(serve(
                    shared.clone(),
                    stream,
                    peer,
                    cancel.clone(),
                    tracker.clone(),
                ));
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                if !shared.reconnector.pause(&cancel).await {
                    break;
                }
            }
        }
    }
    debug!("Exiting connection acceptance loop");
}

async fn serve(
    shared: Arc<Shared>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let kind = tokio::select! {
        _ = cancel.cancelled() => return,
        kind = classify(&stream) => kind,
    };
    match kind {
        RequestKind::Upgrade => {}
        RequestKind::Plain => return respond_plain(stream, peer).await,
        RequestKind::Closed => return,
    }

    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream));
    let handshake = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Abandoning handshake with {}, server stopping", peer);
            return;
        }
        handshake = handshake => handshake,
    };
    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("WebSocket handshake with {} timed out", peer);
            return;
        }
    };

    let (sink, stream) = ws.split();
    let (conn, rx) = {
        let mut registry = shared.registry.write().await;
        let registered = registry.register(peer);
        info!(
            "Client connected from {}, total clients: {}",
            peer,
            registry.len()
        );
        registered
    };
    tracker.spawn(write_loop(sink, rx, peer));

    read_loop(&shared.ctx, &conn, stream, &cancel).await;

    let remaining = {
        let mut registry = shared.registry.write().await;
        registry.remove(conn.id);
        registry.len()
    };
    info!("Client {} disconnected, remaining clients: {}", peer, remaining);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> BroadcastHub {
        BroadcastHub::new(Context::new(), Reconnector::new(Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn broadcast_without_clients_is_a_noop() {
        let hub = hub();
        assert_eq!(hub.broadcast(&Notification::LeftChannel).await, 0);
    }

    #[tokio::test]
    async fn failed_sends_are_pruned() {
        let hub = hub();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (_alive, mut alive_rx) = hub.shared.registry.write().await.register(peer);
        let (_dead, dead_rx) = hub.shared.registry.write().await.register(peer);
        drop(dead_rx);

        assert_eq!(hub.broadcast(&Notification::LeftChannel).await, 1);
        assert_eq!(hub.connection_count().await, 1);
        assert!(alive_rx.try_recv().is_ok());

        assert_eq!(
            hub.broadcast(&Notification::UserNumberChange { user_number: 2 }).await,
            1
        );
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_is_safe() {
        let hub = hub();
        hub.stop().await;

        let first = hub.start(0, BindScope::Local).await.unwrap();
        let second = hub.start(0, BindScope::Local).await.unwrap();
        assert_eq!(first, second);
        assert!(hub.is_running().await);

        hub.stop().await;
        hub.stop().await;
        assert!(!hub.is_running().await);
        assert!(hub.local_addr().await.is_none());
    }
}
