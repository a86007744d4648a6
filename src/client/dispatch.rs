use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::event::{Notification, NotificationSink};
use crate::http::Http;
use crate::model::voice::{Participant, VoiceSettings};
use crate::model::{
    AuthorizeResponse, Channel, ChannelSelect, ChannelType, ErrorData, Guild, IncomingFrame,
    OutgoingFrame, RpcCommand, RpcEvent, SelectedChannel, Snowflake,
};
use crate::reconnect::Reconnector;

use super::session::{
    LinkState, VoiceChannel, DM_PLACEHOLDER, DM_SERVER_LABEL, GROUP_DM_SERVER_LABEL,
};
use super::Context;

fn parse<'a, T: Deserialize<'a>>(data: &'a Value) -> Result<T, BridgeError> {
    Ok(T::deserialize(data)?)
}

fn excerpt(text: &str) -> String {
    text.chars().take(200).collect()
}

fn leading_bytes(text: &str) -> String {
    text.bytes()
        .take(20)
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join("-")
}

/// Turns upstream frames into state changes, follow-up requests and notifications.
///
/// Frames are handled one at a time by the connection's read loop, so nothing in
/// here ever races with itself. The session lock is only held for bookkeeping and
/// is always released before a frame is sent or a notification emitted.
pub(crate) struct Dispatcher {
    ctx: Context,
    http: Arc<Http>,
    sink: Arc<dyn NotificationSink>,
    client_id: String,
    reconnector: Reconnector,
}

impl Dispatcher {
    pub(crate) fn new(
        ctx: Context,
        http: Arc<Http>,
        sink: Arc<dyn NotificationSink>,
        client_id: String,
        reconnector: Reconnector,
    ) -> Self {
        Self {
            ctx,
            http,
            sink,
            client_id,
            reconnector,
        }
    }

    /// Handle one text frame. Malformed payloads are logged and dropped; only
    /// failures that end the connection attempt are returned.
    pub(crate) async fn handle_text(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        let text = text.trim();
        if text.is_empty() {
            debug!("Skipping empty frame");
            return Ok(());
        }
        if text.starts_with('<') {
            warn!("Received HTML instead of JSON: {}", excerpt(text));
            return Ok(());
        }
        debug!("<- {}", text);

        let result = match serde_json::from_str::<IncomingFrame>(text) {
            Ok(frame) => self.handle_frame(frame, cancel).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Err(e @ (BridgeError::Json(_) | BridgeError::Protocol(_))) => {
                warn!(
                    "Discarding frame: {} | first bytes: {} | content: {}",
                    e,
                    leading_bytes(text),
                    excerpt(text)
                );
                Ok(())
            }
            other => other,
        }
    }

    pub(crate) async fn handle_frame(
        &self,
        frame: IncomingFrame,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        if frame.is_error() && !matches!(frame.cmd, RpcCommand::Dispatch | RpcCommand::Authenticate) {
            let err: ErrorData = parse(&frame.data)?;
            return Err(BridgeError::Protocol(format!("{:?} failed: {}", frame.cmd, err)));
        }

        match frame.cmd {
            RpcCommand::Dispatch => self.on_dispatch(frame).await,
            RpcCommand::Authorize => self.on_authorize(&frame.data).await,
            RpcCommand::Authenticate => self.on_authenticate(&frame, cancel).await,
            RpcCommand::GetSelectedVoiceChannel => self.on_selected_channel(&frame.data).await,
            RpcCommand::GetChannel => self.on_channel(&frame.data).await,
            RpcCommand::GetGuild => self.on_guild(&frame.data).await,
            RpcCommand::Subscribe
            | RpcCommand::Unsubscribe
            | RpcCommand::SetVoiceSettings
            | RpcCommand::SelectVoiceChannel => {
                debug!("{:?} acknowledged", frame.cmd);
                Ok(())
            }
            RpcCommand::Unknown => {
                debug!("Unhandled command (nonce {:?})", frame.nonce);
                Ok(())
            }
        }
    }

    async fn on_dispatch(&self, frame: IncomingFrame) -> Result<(), BridgeError> {
        match frame.evt {
            Some(RpcEvent::Ready) => {
                info!("RPC server ready, authorizing");
                self.authorize().await
            }
            Some(RpcEvent::VoiceChannelSelect) => {
                let select: ChannelSelect = parse(&frame.data)?;
                match &select.guild_id {
                    Some(guild_id) => debug!("Channel select in guild {}", guild_id),
                    None => debug!("Channel select without guild, DM or group call"),
                }
                self.select_channel(select.channel_id).await
            }
            Some(RpcEvent::VoiceStateCreate) => {
                let participant: Participant = parse(&frame.data)?;
                self.member_joined(participant).await;
                Ok(())
            }
            Some(RpcEvent::VoiceStateDelete) => {
                self.member_left().await;
                Ok(())
            }
            Some(RpcEvent::VoiceSettingsUpdate) => {
                let settings: VoiceSettings = parse(&frame.data)?;
                self.ctx.session.lock().await.settings = Some(settings);
                self.sink
                    .notify(Notification::UserVoiceStateUpdate {
                        mute: settings.mute,
                        deaf: settings.deaf,
                    })
                    .await;
                Ok(())
            }
            Some(RpcEvent::Error) => {
                let err: ErrorData = parse(&frame.data)?;
                Err(BridgeError::Protocol(format!("error event: {}", err)))
            }
            Some(RpcEvent::Unknown) | None => {
                debug!("Unhandled dispatch event");
                Ok(())
            }
        }
    }

    async fn authorize(&self) -> Result<(), BridgeError> {
        {
            let mut session = self.ctx.session.lock().await;
            session.access_token = None;
            session.link_state = LinkState::AwaitingAuthorize;
        }
        self.ctx.send(OutgoingFrame::authorize(&self.client_id)).await
    }

    async fn on_authorize(&self, data: &Value) -> Result<(), BridgeError> {
        let response: AuthorizeResponse = parse(data)?;
        let code = match response.code.filter(|c| !c.is_empty()) {
            Some(code) => code,
            None => return Err(BridgeError::Protocol("AUTHORIZE response without code".into())),
        };

        self.ctx.session.lock().await.link_state = LinkState::AwaitingCodeExchange;

        let token = match self.http.exchange_code(&code).await {
            Ok(token) => token,
            Err(e) => {
                error!("Failed to get access token: {}", e);
                return Err(e);
            }
        };

        {
            let mut session = self.ctx.session.lock().await;
            session.access_token = Some(token.clone());
            session.link_state = LinkState::AwaitingAuthenticate;
        }
        self.ctx.send(OutgoingFrame::authenticate(&token)).await
    }

    async fn on_authenticate(
        &self,
        frame: &IncomingFrame,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        if frame.is_error() {
            let err: ErrorData = parse(&frame.data).unwrap_or(ErrorData {
                code: None,
                message: None,
            });
            warn!("{}, re-authorizing", BridgeError::Auth(err.to_string()));
            {
                let mut session = self.ctx.session.lock().await;
                session.access_token = None;
                session.link_state = LinkState::AwaitingAuthorize;
            }
            if !self.reconnector.pause(cancel).await {
                return Ok(());
            }
            return self.authorize().await;
        }

        info!("Authenticated, subscribing to voice events");
        self.ctx.session.lock().await.link_state = LinkState::Ready;
        self.ctx
            .send(OutgoingFrame::subscribe(RpcEvent::VoiceChannelSelect, None))
            .await?;
        self.ctx
            .send(OutgoingFrame::subscribe(RpcEvent::VoiceSettingsUpdate, None))
            .await?;
        self.ctx
            .send(OutgoingFrame::get_selected_voice_channel())
            .await
    }

    async fn on_selected_channel(&self, data: &Value) -> Result<(), BridgeError> {
        if data.is_null() {
            info!("User is not in a voice channel");
            return self.select_channel(None).await;
        }

        let selected: SelectedChannel = parse(data)?;
        match selected.id.filter(|id| !id.is_empty()) {
            Some(id) => self.select_channel(Some(id)).await,
            None => Err(BridgeError::Protocol("selected channel without id".into())),
        }
    }

    async fn select_channel(&self, channel_id: Option<Snowflake>) -> Result<(), BridgeError> {
        let previous = self.ctx.session.lock().await.channel_id.clone();

        if let Some(previous) = &previous {
            if channel_id.as_ref() != Some(previous) {
                self.voice_state_subscription(previous, false).await?;
            }
        }

        match channel_id {
            None => {
                info!("Left voice channel");
                self.ctx.session.lock().await.clear_channel();
                self.sink.notify(Notification::LeftChannel).await;
                Ok(())
            }
            Some(id) if previous.as_ref() == Some(&id) => {
                self.ctx.send(OutgoingFrame::get_channel(&id)).await
            }
            Some(id) => self.enter_channel(id).await,
        }
    }

    async fn enter_channel(&self, channel_id: Snowflake) -> Result<(), BridgeError> {
        self.ctx
            .session
            .lock()
            .await
            .enter_channel(channel_id.clone());
        self.voice_state_subscription(&channel_id, true).await?;
        self.ctx.send(OutgoingFrame::get_channel(&channel_id)).await
    }

    async fn voice_state_subscription(
        &self,
        channel_id: &str,
        subscribe: bool,
    ) -> Result<(), BridgeError> {
        for evt in [RpcEvent::VoiceStateCreate, RpcEvent::VoiceStateDelete] {
            let args = Some(json!({ "channel_id": channel_id }));
            let frame = if subscribe {
                OutgoingFrame::subscribe(evt, args)
            } else {
                OutgoingFrame::unsubscribe(evt, args)
            };
            self.ctx.send(frame).await?;
        }
        if subscribe {
            info!("Subscribed to voice state events for channel {}", channel_id);
        } else {
            info!("Unsubscribed from voice state events for channel {}", channel_id);
        }
        Ok(())
    }

    async fn on_channel(&self, data: &Value) -> Result<(), BridgeError> {
        let channel: Channel = parse(data)?;

        let current = self.ctx.session.lock().await.channel_id.clone();
        if current.as_deref() != Some(channel.id.as_str()) {
            debug!("Ignoring stale resolution of channel {}", channel.id);
            return Ok(());
        }

        let kind = match channel.channel_type() {
            Ok(kind) => kind,
            Err(raw) => {
                info!("Unrecognized channel type {} for channel {}", raw, channel.id);
                return Ok(());
            }
        };

        let count = channel.member_count();
        let name = channel.name.clone().unwrap_or_default();
        let display_name = match kind {
            ChannelType::Dm => channel
                .first_participant()
                .map(|p| p.display_name().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| DM_PLACEHOLDER.to_string()),
            _ => name.clone(),
        };
        let server_label = match kind {
            ChannelType::Dm => Some(DM_SERVER_LABEL.to_string()),
            ChannelType::GroupDm => Some(GROUP_DM_SERVER_LABEL.to_string()),
            ChannelType::Text | ChannelType::Voice => None,
        };

        {
            let mut session = self.ctx.session.lock().await;
            session.reconcile_members(count);
            session.channel = Some(VoiceChannel {
                id: channel.id.clone(),
                name,
                kind,
                guild_id: channel.guild_id.clone(),
            });
            session.display_name = Some(display_name.clone());
            session.server_name = server_label.clone();
            session.dm_channel = kind == ChannelType::Dm;
            session.dm_peer_named = count > 1;
        }
        debug!("Channel {} resolved with {} member(s)", channel.id, count);

        match kind {
            ChannelType::Text => {
                info!("Text channel, nothing to relay");
            }
            ChannelType::Voice => {
                match &channel.guild_id {
                    Some(guild_id) => self.ctx.send(OutgoingFrame::get_guild(guild_id)).await?,
                    None => warn!("Voice channel {} has no guild", channel.id),
                }
                self.joined(display_name, count).await;
            }
            ChannelType::Dm | ChannelType::GroupDm => {
                self.joined(display_name, count).await;
                if let Some(server_name) = server_label {
                    self.sink
                        .notify(Notification::ServerNameUpdate { server_name })
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn on_guild(&self, data: &Value) -> Result<(), BridgeError> {
        let guild: Guild = parse(data)?;
        let server_name = guild.name.unwrap_or_default();

        {
            let mut session = self.ctx.session.lock().await;
            let expected = session.channel.as_ref().and_then(|c| c.guild_id.as_deref());
            if expected != Some(guild.id.as_str()) {
                debug!("Ignoring stale resolution of guild {}", guild.id);
                return Ok(());
            }
            session.server_name = Some(server_name.clone());
        }

        self.sink
            .notify(Notification::ServerNameUpdate { server_name })
            .await;
        Ok(())
    }

    async fn member_joined(&self, participant: Participant) {
        let (count, peer_name) = {
            let mut session = self.ctx.session.lock().await;
            let (previous, count) = session.member_joined();
            let name = participant.display_name();
            let peer_name = if !name.is_empty() && session.claims_dm_peer(previous, count) {
                let name = name.to_string();
                session.display_name = Some(name.clone());
                Some(name)
            } else {
                None
            };
            (count, peer_name)
        };
        info!("User joined voice channel. Total users: {}", count);

        self.sink
            .notify(Notification::UserNumberChange { user_number: count })
            .await;
        if let Some(channel_name) = peer_name {
            self.joined(channel_name, count).await;
        }
    }

    async fn member_left(&self) {
        let count = self.ctx.session.lock().await.member_left();
        info!("User left voice channel. Total users: {}", count);
        self.sink
            .notify(Notification::UserNumberChange { user_number: count })
            .await;
    }

    async fn joined(&self, channel_name: String, user_number: u32) {
        self.sink
            .notify(Notification::JoinedChannel {
                channel_name,
                user_number,
            })
            .await;
    }
}
