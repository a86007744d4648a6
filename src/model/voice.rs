use serde::{Deserialize, Serialize};

use super::User;

/// The local user's self-mute and self-deafen flags, as last reported by a
/// `VOICE_SETTINGS_UPDATE` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub mute: bool,
    pub deaf: bool,
}

/// Arguments of `SET_VOICE_SETTINGS`. Only the fields being changed are sent.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VoiceSettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deaf: Option<bool>,
}

/// One entry of a channel's `voice_states`, also the payload of
/// `VOICE_STATE_CREATE` / `VOICE_STATE_DELETE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub nick: Option<String>,
    pub user: Option<User>,
}

impl Participant {
    pub fn display_name(&self) -> &str {
        if let Some(nick) = &self.nick {
            return nick.as_str();
        }
        self.user
            .as_ref()
            .map(|u| u.username.as_str())
            .unwrap_or("")
    }
}
