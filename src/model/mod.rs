pub mod voice;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use self::voice::{Participant, VoiceSettingsPatch};

pub type Snowflake = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCommand {
    Dispatch,
    Authorize,
    Authenticate,
    Subscribe,
    Unsubscribe,
    SetVoiceSettings,
    SelectVoiceChannel,
    GetChannel,
    GetGuild,
    GetSelectedVoiceChannel,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcEvent {
    Ready,
    Error,
    VoiceChannelSelect,
    VoiceStateCreate,
    VoiceStateDelete,
    VoiceSettingsUpdate,
    #[serde(other)]
    Unknown,
}

/// A frame as received from the RPC socket. Responses echo the `cmd` of the
/// request; server-pushed events carry `cmd: DISPATCH` and an `evt`.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingFrame {
    pub cmd: RpcCommand,
    #[serde(default)]
    pub evt: Option<RpcEvent>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub nonce: Option<String>,
}

impl IncomingFrame {
    pub fn is_error(&self) -> bool {
        self.evt == Some(RpcEvent::Error)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingFrame {
    pub cmd: RpcCommand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evt: Option<RpcEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    pub nonce: String,
}

impl OutgoingFrame {
    pub fn new(cmd: RpcCommand, evt: Option<RpcEvent>, args: Option<Value>) -> Self {
        Self {
            cmd,
            evt,
            args,
            nonce: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn authorize(client_id: &str) -> Self {
        Self::new(
            RpcCommand::Authorize,
            None,
            Some(json!({
                "client_id": client_id,
                "scopes": ["rpc"],
                "prompt": "none"
            })),
        )
    }

    pub fn authenticate(access_token: &str) -> Self {
        Self::new(
            RpcCommand::Authenticate,
            None,
            Some(json!({ "access_token": access_token })),
        )
    }

    pub fn subscribe(evt: RpcEvent, args: Option<Value>) -> Self {
        Self::new(RpcCommand::Subscribe, Some(evt), args)
    }

    pub fn unsubscribe(evt: RpcEvent, args: Option<Value>) -> Self {
        Self::new(RpcCommand::Unsubscribe, Some(evt), args)
    }

    pub fn set_voice_settings(patch: VoiceSettingsPatch) -> Self {
        Self::new(
            RpcCommand::SetVoiceSettings,
            None,
            serde_json::to_value(patch).ok(),
        )
    }

    /// `SELECT_VOICE_CHANNEL` with a null id, forced so it also applies when
    /// the user is in a call.
    pub fn leave_voice_channel() -> Self {
        Self::new(
            RpcCommand::SelectVoiceChannel,
            None,
            Some(json!({ "channel_id": null, "force": true })),
        )
    }

    pub fn get_channel(channel_id: &str) -> Self {
        Self::new(
            RpcCommand::GetChannel,
            None,
            Some(json!({ "channel_id": channel_id })),
        )
    }

    pub fn get_guild(guild_id: &str) -> Self {
        Self::new(
            RpcCommand::GetGuild,
            None,
            Some(json!({ "guild_id": guild_id })),
        )
    }

    pub fn get_selected_voice_channel() -> Self {
        Self::new(RpcCommand::GetSelectedVoiceChannel, None, None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Snowflake,
    #[serde(default)]
    pub username: String,
    pub global_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelType {
    Text = 0,
    Dm = 1,
    Voice = 2,
    GroupDm = 3,
}

impl TryFrom<u8> for ChannelType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChannelType::Text),
            1 => Ok(ChannelType::Dm),
            2 => Ok(ChannelType::Voice),
            3 => Ok(ChannelType::GroupDm),
            other => Err(other),
        }
    }
}

/// Payload of a `GET_CHANNEL` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Snowflake,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: u8,
    pub guild_id: Option<Snowflake>,
    pub voice_states: Option<Vec<Participant>>,
}

impl Channel {
    pub fn channel_type(&self) -> Result<ChannelType, u8> {
        ChannelType::try_from(self.kind)
    }

    /// Members present in the channel. The local user is always one of them, so an
    /// absent or empty list still counts as one.
    pub fn member_count(&self) -> u32 {
        let listed = self.voice_states.as_ref().map_or(0, Vec::len);
        u32::try_from(listed).unwrap_or(u32::MAX).max(1)
    }

    pub fn first_participant(&self) -> Option<&Participant> {
        self.voice_states.as_ref().and_then(|states| states.first())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    pub id: Snowflake,
    pub name: Option<String>,
}

/// Non-null payload of a `GET_SELECTED_VOICE_CHANNEL` response.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectedChannel {
    pub id: Option<Snowflake>,
}

/// `VOICE_CHANNEL_SELECT` dispatch payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSelect {
    pub channel_id: Option<Snowflake>,
    pub guild_id: Option<Snowflake>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeResponse {
    pub code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub code: Option<u64>,
    pub message: Option<String>,
}

impl std::fmt::Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "{} ({})", message, code),
            (None, Some(message)) => f.write_str(message),
            (Some(code), None) => write!(f, "error code {}", code),
            (None, None) => f.write_str("unknown error"),
        }
    }
}
