use std::time::Duration;

use clap::Parser;

use crate::client::{DEFAULT_CLIENT_ID, DEFAULT_ORIGIN, DEFAULT_RPC_URL};
use crate::http::DEFAULT_TOKEN_URL;
use crate::hub::{BindScope, DEFAULT_PORT};
use crate::reconnect::Reconnector;

/// Relay local voice-chat state to display clients over WebSocket.
#[derive(Debug, Clone, Parser)]
#[command(name = "voice-bridge", version, about)]
pub struct Config {
    /// Port the display-client WebSocket server listens on.
    #[arg(long, env = "BRIDGE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interfaces to listen on.
    #[arg(long, env = "BRIDGE_BIND", value_enum, default_value_t = BindScope::All)]
    pub bind: BindScope,

    /// Application id presented when authorizing against the RPC server.
    #[arg(long, env = "BRIDGE_CLIENT_ID", default_value = DEFAULT_CLIENT_ID)]
    pub client_id: String,

    /// Base URL of the local RPC WebSocket.
    #[arg(long, env = "BRIDGE_RPC_URL", default_value = DEFAULT_RPC_URL)]
    pub rpc_url: String,

    /// Origin header sent on the RPC handshake.
    #[arg(long, env = "BRIDGE_ORIGIN", default_value = DEFAULT_ORIGIN)]
    pub origin: String,

    /// Endpoint that trades an authorization code for an access token.
    #[arg(long, env = "BRIDGE_TOKEN_URL", default_value = DEFAULT_TOKEN_URL)]
    pub token_url: String,

    /// Seconds to wait before reconnecting after a failure.
    #[arg(long, env = "BRIDGE_RECONNECT_DELAY_SECS", default_value_t = 5)]
    pub reconnect_delay_secs: u64,

    /// Reconnect attempts made per failure.
    #[arg(long, env = "BRIDGE_RECONNECT_ATTEMPTS", default_value_t = 1)]
    pub reconnect_attempts: u32,

    /// Double the delay after each failed attempt, up to this many seconds.
    #[arg(long, env = "BRIDGE_RECONNECT_MAX_DELAY_SECS")]
    pub reconnect_max_delay_secs: Option<u64>,
}

impl Config {
    pub fn reconnector(&self) -> Reconnector {
        let reconnector = Reconnector::new(Duration::from_secs(self.reconnect_delay_secs))
            .attempts(self.reconnect_attempts);
        match self.reconnect_max_delay_secs {
            Some(max) => reconnector.capped_backoff(Duration::from_secs(max)),
            None => reconnector,
        }
    }
}
