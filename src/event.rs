//! Notifications pushed to display clients.
//!
//! Every downstream payload is a JSON object whose `cmd` field names the
//! variant. Display clients apply them as partial updates, so each variant only
//! carries the fields it changes.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    UserNumberChange { user_number: u32 },

    LeftChannel,

    #[serde(rename_all = "camelCase")]
    JoinedChannel { channel_name: String, user_number: u32 },

    UserVoiceStateUpdate { mute: bool, deaf: bool },

    #[serde(rename_all = "camelCase")]
    ServerNameUpdate { server_name: String },

    /// Direct reply to `getInitialState`. Never broadcast.
    GetInitialState(Snapshot),

    /// Reply to `getInitialState` before any voice settings were received.
    StateUnavailable,
}

impl Notification {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Everything a freshly connected display client needs to draw its first screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub mute: bool,
    pub deaf: bool,
    pub channel_name: String,
    pub users: u32,
    pub server_name: String,
}

/// Where the upstream client sends the notifications it derives from RPC events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

#[async_trait]
impl NotificationSink for mpsc::UnboundedSender<Notification> {
    async fn notify(&self, notification: Notification) {
        if self.send(notification).is_err() {
            log::debug!("Notification receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoded(n: Notification) -> serde_json::Value {
        serde_json::from_str(&n.to_json().unwrap()).unwrap()
    }

    #[test]
    fn payloads_use_cmd_discriminator() {
        assert_eq!(
            encoded(Notification::UserNumberChange { user_number: 3 }),
            json!({"cmd": "USER_NUMBER_CHANGE", "userNumber": 3})
        );
        assert_eq!(encoded(Notification::LeftChannel), json!({"cmd": "LEFT_CHANNEL"}));
        assert_eq!(
            encoded(Notification::JoinedChannel {
                channel_name: "General".into(),
                user_number: 2
            }),
            json!({"cmd": "JOINED_CHANNEL", "channelName": "General", "userNumber": 2})
        );
        assert_eq!(
            encoded(Notification::UserVoiceStateUpdate { mute: true, deaf: false }),
            json!({"cmd": "USER_VOICE_STATE_UPDATE", "mute": true, "deaf": false})
        );
        assert_eq!(
            encoded(Notification::ServerNameUpdate {
                server_name: "Private Call".into()
            }),
            json!({"cmd": "SERVER_NAME_UPDATE", "serverName": "Private Call"})
        );
    }

    #[test]
    fn initial_state_is_flat() {
        let snapshot = Snapshot {
            mute: false,
            deaf: true,
            channel_name: "Lobby".into(),
            users: 4,
            server_name: "Guild".into(),
        };
        assert_eq!(
            encoded(Notification::GetInitialState(snapshot)),
            json!({
                "cmd": "GET_INITIAL_STATE",
                "mute": false,
                "deaf": true,
                "channelName": "Lobby",
                "users": 4,
                "serverName": "Guild"
            })
        );
        assert_eq!(
            encoded(Notification::StateUnavailable),
            json!({"cmd": "STATE_UNAVAILABLE"})
        );
    }
}
