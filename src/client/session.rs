//! Voice state derived from the upstream event stream.
//!
//! Everything in here is mutated only from the upstream processing path, under
//! the single lock held by [`Context`](super::Context). The methods are plain
//! synchronous bookkeeping; sending frames and emitting notifications happens in
//! the dispatcher once the lock is released.

use tokio::sync::mpsc;

use crate::event::Snapshot;
use crate::model::voice::VoiceSettings;
use crate::model::{ChannelType, Snowflake};

pub const DM_PLACEHOLDER: &str = "Calling…";
pub const DM_SERVER_LABEL: &str = "Private Call";
pub const GROUP_DM_SERVER_LABEL: &str = "Group Call";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingAuthorize,
    AwaitingCodeExchange,
    AwaitingAuthenticate,
    Ready,
    ChannelSelected,
    NoChannel,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceChannel {
    pub id: Snowflake,
    pub name: String,
    pub kind: ChannelType,
    pub guild_id: Option<Snowflake>,
}

#[derive(Debug, Default)]
pub struct Session {
    pub(crate) link_state: LinkState,
    pub(crate) outbound: Option<mpsc::Sender<String>>,
    pub(crate) access_token: Option<String>,
    pub(crate) settings: Option<VoiceSettings>,
    /// Channel whose voice-state events are currently subscribed.
    pub(crate) channel_id: Option<Snowflake>,
    pub(crate) channel: Option<VoiceChannel>,
    /// Name shown to display clients; differs from `channel.name` for DMs.
    pub(crate) display_name: Option<String>,
    pub(crate) server_name: Option<String>,
    pub(crate) user_count: u32,
    pub(crate) dm_channel: bool,
    pub(crate) dm_peer_named: bool,
}

impl Session {
    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub fn settings(&self) -> Option<VoiceSettings> {
        self.settings
    }

    pub fn user_count(&self) -> u32 {
        self.user_count
    }

    /// Returns `(previous, current)` counts.
    pub(crate) fn member_joined(&mut self) -> (u32, u32) {
        let previous = self.user_count;
        self.user_count = previous.saturating_add(1);
        (previous, self.user_count)
    }

    pub(crate) fn member_left(&mut self) -> u32 {
        self.user_count = self.user_count.saturating_sub(1);
        self.user_count
    }

    /// An authoritative member list replaces whatever was counted incrementally.
    pub(crate) fn reconcile_members(&mut self, count: u32) {
        self.user_count = count;
    }

    /// Whether a join taking the count from `previous` to `current` names the DM peer.
    /// Only the first transition away from "just me" counts.
    pub(crate) fn claims_dm_peer(&mut self, previous: u32, current: u32) -> bool {
        if self.dm_channel && !self.dm_peer_named && previous == 1 && current > 1 {
            self.dm_peer_named = true;
            return true;
        }
        false
    }

    /// Start tracking `channel_id`; resolution fills in the rest.
    pub(crate) fn enter_channel(&mut self, channel_id: Snowflake) {
        self.channel_id = Some(channel_id);
        self.link_state = LinkState::ChannelSelected;
    }

    pub(crate) fn clear_channel(&mut self) {
        self.channel_id = None;
        self.channel = None;
        self.display_name = None;
        self.server_name = None;
        self.user_count = 0;
        self.dm_channel = false;
        self.dm_peer_named = false;
        self.link_state = LinkState::NoChannel;
    }

    /// Forget everything tied to one upstream connection. Subscriptions and the
    /// access token die with the socket; voice settings and the last known channel
    /// stay until fresh events replace them.
    pub(crate) fn detach(&mut self, next: LinkState) {
        self.outbound = None;
        self.access_token = None;
        self.channel_id = None;
        self.link_state = next;
    }

    /// `None` until the first settings event; never a partially filled snapshot.
    pub fn snapshot(&self) -> Option<Snapshot> {
        let settings = self.settings?;
        let in_channel = self.channel.is_some();

        Some(Snapshot {
            mute: settings.mute,
            deaf: settings.deaf,
            channel_name: if in_channel {
                self.display_name.clone().unwrap_or_default()
            } else {
                String::new()
            },
            users: if in_channel { self.user_count } else { 0 },
            server_name: if in_channel {
                self.server_name.clone().unwrap_or_default()
            } else {
                String::new()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_never_goes_negative() {
        let mut session = Session::default();
        assert_eq!(session.member_left(), 0);
        assert_eq!(session.member_joined(), (0, 1));
        assert_eq!(session.member_left(), 0);
        assert_eq!(session.member_left(), 0);

        // interleaved bursts
        for step in [true, false, false, true, true, false, false, false, true] {
            let count = if step {
                session.member_joined().1
            } else {
                session.member_left()
            };
            assert!(count <= 9);
        }
        assert_eq!(session.user_count(), 1);
    }

    #[test]
    fn reconcile_overrides_incremental_count() {
        let mut session = Session::default();
        for _ in 0..7 {
            session.member_joined();
        }
        session.reconcile_members(3);
        assert_eq!(session.user_count(), 3);
        session.member_left();
        session.reconcile_members(5);
        assert_eq!(session.user_count(), 5);
    }

    #[test]
    fn dm_peer_is_named_once() {
        let mut session = Session {
            dm_channel: true,
            user_count: 1,
            ..Session::default()
        };

        let (prev, cur) = session.member_joined();
        assert!(session.claims_dm_peer(prev, cur));

        session.member_left();
        let (prev, cur) = session.member_joined();
        assert!(!session.claims_dm_peer(prev, cur));
    }

    #[test]
    fn group_calls_never_claim_a_peer() {
        let mut session = Session {
            user_count: 1,
            ..Session::default()
        };
        let (prev, cur) = session.member_joined();
        assert!(!session.claims_dm_peer(prev, cur));
    }

    #[test]
    fn snapshot_requires_settings() {
        let mut session = Session::default();
        session.enter_channel("1".into());
        session.channel = Some(VoiceChannel {
            id: "1".into(),
            name: "General".into(),
            kind: ChannelType::Voice,
            guild_id: Some("9".into()),
        });
        session.display_name = Some("General".into());
        session.user_count = 2;
        assert!(session.snapshot().is_none());

        session.settings = Some(VoiceSettings {
            mute: true,
            deaf: false,
        });
        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.channel_name, "General");
        assert_eq!(snapshot.users, 2);
        assert_eq!(snapshot.server_name, "");
        assert!(snapshot.mute);
    }

    #[test]
    fn snapshot_outside_a_channel_is_blank() {
        let mut session = Session {
            settings: Some(VoiceSettings {
                mute: false,
                deaf: true,
            }),
            user_count: 4,
            ..Session::default()
        };
        session.clear_channel();
        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.channel_name, "");
        assert_eq!(snapshot.users, 0);
        assert!(snapshot.deaf);
        assert_eq!(session.link_state(), LinkState::NoChannel);
    }
}
