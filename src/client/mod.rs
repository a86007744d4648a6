pub mod dispatch;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::BridgeError;
use crate::event::{Notification, NotificationSink};
use crate::http::{Http, DEFAULT_TOKEN_URL};
use crate::model::voice::VoiceSettingsPatch;
use crate::model::OutgoingFrame;
use crate::reconnect::Reconnector;

use self::dispatch::Dispatcher;
use self::session::{LinkState, Session};

pub const DEFAULT_CLIENT_ID: &str = "207646673902501888";
pub const DEFAULT_RPC_URL: &str = "ws://127.0.0.1:6463";
pub const DEFAULT_ORIGIN: &str = "http://localhost:3000";

const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type RpcStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The one voice session shared by the upstream client and the hub.
///
/// Built once by the composition root and handed to both sides. The hub only
/// reads the derived state and issues commands through it; all mutation of the
/// derived state happens on the upstream read loop.
#[derive(Clone, Default)]
pub struct Context {
    pub(crate) session: Arc<Mutex<Session>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn link_state(&self) -> LinkState {
        self.session.lock().await.link_state()
    }

    pub(crate) async fn attach(&self, outbound: mpsc::Sender<String>) {
        let mut session = self.session.lock().await;
        session.outbound = Some(outbound);
        session.link_state = LinkState::Connecting;
    }

    pub(crate) async fn detach(&self, next: LinkState) {
        self.session.lock().await.detach(next);
    }

    async fn set_link_state(&self, state: LinkState) {
        self.session.lock().await.link_state = state;
    }

    pub(crate) async fn send(&self, frame: OutgoingFrame) -> Result<(), BridgeError> {
        let outbound = self
            .session
            .lock()
            .await
            .outbound
            .clone()
            .ok_or(BridgeError::NotConnected)?;

        let text = serde_json::to_string(&frame)?;
        debug!("-> {}", text);
        outbound
            .send(text)
            .await
            .map_err(|_| BridgeError::ConnectionClosed)
    }

    pub async fn toggle_mute(&self) -> Result<(), BridgeError> {
        let settings = self
            .session
            .lock()
            .await
            .settings()
            .ok_or(BridgeError::StateUnavailable)?;
        self.send(OutgoingFrame::set_voice_settings(VoiceSettingsPatch {
            mute: Some(!settings.mute),
            deaf: None,
        }))
        .await
    }

    pub async fn toggle_deafen(&self) -> Result<(), BridgeError> {
        let settings = self
            .session
            .lock()
            .await
            .settings()
            .ok_or(BridgeError::StateUnavailable)?;
        self.send(OutgoingFrame::set_voice_settings(VoiceSettingsPatch {
            mute: None,
            deaf: Some(!settings.deaf),
        }))
        .await
    }

    pub async fn leave_channel(&self) -> Result<(), BridgeError> {
        self.send(OutgoingFrame::leave_voice_channel()).await
    }

    /// Reply for a display client asking for the full picture.
    pub async fn initial_state(&self) -> Notification {
        match self.session.lock().await.snapshot() {
            Some(snapshot) => Notification::GetInitialState(snapshot),
            None => Notification::StateUnavailable,
        }
    }
}

pub struct ClientBuilder {
    client_id: String,
    rpc_url: String,
    origin: String,
    token_url: String,
    reconnector: Reconnector,
    context: Option<Context>,
    sink: Arc<dyn NotificationSink>,
}

impl ClientBuilder {
    pub fn new(client_id: impl Into<String>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            client_id: client_id.into(),
            rpc_url: DEFAULT_RPC_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            reconnector: Reconnector::default(),
            context: None,
            sink,
        }
    }

    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = url.into();
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub fn reconnector(mut self, reconnector: Reconnector) -> Self {
        self.reconnector = reconnector;
        self
    }

    pub fn context(mut self, ctx: Context) -> Self {
        self.context = Some(ctx);
        self
    }

    pub fn build(self) -> Result<Client, BridgeError> {
        let mut connect_url = Url::parse(&self.rpc_url)
            .map_err(|e| BridgeError::Protocol(format!("invalid RPC url {}: {}", self.rpc_url, e)))?;
        connect_url
            .query_pairs_mut()
            .append_pair("v", "1")
            .append_pair("encoding", "json")
            .append_pair("client_id", &self.client_id);

        let ctx = self.context.unwrap_or_default();
        let http = Arc::new(Http::new(self.token_url)?);
        let dispatcher = Dispatcher::new(
            ctx.clone(),
            http,
            self.sink,
            self.client_id,
            self.reconnector.clone(),
        );

        Ok(Client {
            ctx,
            dispatcher,
            connect_url,
            origin: self.origin,
            reconnector: self.reconnector,
        })
    }
}

/// Owns the connection to the voice client's local RPC socket.
pub struct Client {
    ctx: Context,
    dispatcher: Dispatcher,
    connect_url: Url,
    origin: String,
    reconnector: Reconnector,
}

impl Client {
    pub fn builder(client_id: impl Into<String>, sink: Arc<dyn NotificationSink>) -> ClientBuilder {
        ClientBuilder::new(client_id, sink)
    }

    pub fn context(&self) -> Context {
        self.ctx.clone()
    }

    pub fn connect_url(&self) -> &Url {
        &self.connect_url
    }

    /// Keep the upstream link alive until `cancel` fires.
    ///
    /// Each time the link drops, the [`Reconnector`] gets one go at bringing it
    /// back. If that fails too the loop gives up and the session stays down.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut pending = match self.connect().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!("Failed to connect to RPC server: {}", e);
                None
            }
        };

        loop {
            let stream = match pending.take() {
                Some(stream) => stream,
                None => {
                    self.ctx.set_link_state(LinkState::Reconnecting).await;
                    match self.reconnector.retry(&cancel, || self.connect()).await {
                        Some(stream) => stream,
                        None => {
                            self.ctx.set_link_state(LinkState::Disconnected).await;
                            if !cancel.is_cancelled() {
                                error!("Reconnection failed, upstream link stays down");
                            }
                            return;
                        }
                    }
                }
            };

            info!("Connected to RPC server");
            match self.run_session(stream, &cancel).await {
                Ok(()) => {
                    info!("Upstream link closed");
                    return;
                }
                Err(e) if e.is_transport() => warn!("Upstream link lost: {}", e),
                Err(e) => error!("Upstream session aborted: {}", e),
            }
        }
    }

    async fn connect(&self) -> Result<RpcStream, BridgeError> {
        self.ctx.set_link_state(LinkState::Connecting).await;

        let mut request = self.connect_url.as_str().into_client_request()?;
        let origin = HeaderValue::from_str(&self.origin)
            .map_err(|e| BridgeError::Protocol(format!("invalid origin header: {}", e)))?;
        request.headers_mut().insert(ORIGIN, origin);

        let (stream, _) = connect_async(request).await?;
        Ok(stream)
    }

    /// Drive one connection until it fails or `cancel` fires. `Ok` only on cancel.
    async fn run_session(
        &self,
        stream: RpcStream,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(32);
        self.ctx.attach(tx).await;

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                match tokio::time::timeout(WRITE_TIMEOUT, write.send(WsMessage::Text(text.into())))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Failed to write to RPC socket: {}", e);
                        break;
                    }
                    Err(_) => {
                        warn!("Timed out writing to RPC socket");
                        break;
                    }
                }
            }
            rx.close();
            let _ = tokio::time::timeout(WRITE_TIMEOUT, write.close()).await;
        });
        let writer_abort = writer.abort_handle();

        let result = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                next = read.next() => next,
            };

            match next {
                Some(Ok(WsMessage::Text(text))) => {
                    let handled = tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        handled = self.dispatcher.handle_text(text.as_str(), cancel) => handled,
                    };
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!("RPC server closed the connection: {:?}", frame);
                    break Err(BridgeError::ConnectionClosed);
                }
                Some(Ok(WsMessage::Binary(_))) => warn!("Ignoring binary frame from RPC server"),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
                None => break Err(BridgeError::ConnectionClosed),
            }
        };

        let next = if result.is_ok() {
            LinkState::Disconnected
        } else {
            LinkState::Reconnecting
        };
        self.ctx.detach(next).await;
        if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer).await.is_err() {
            writer_abort.abort();
        }
        result
    }
}
