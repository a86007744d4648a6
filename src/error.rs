//! Error types used across the bridge.

use thiserror::Error;

/// The error type returned by pretty much everything in the crate.
///
/// None of these are fatal to the process. Transport-level variants
/// ([`WebSocket`](BridgeError::WebSocket), [`Io`](BridgeError::Io),
/// [`ConnectionClosed`](BridgeError::ConnectionClosed)) end the current upstream
/// session and hand control to the [`Reconnector`](crate::reconnect::Reconnector).
/// Everything else is logged where it happens and the offending frame or command
/// is dropped.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport-level failure of the token exchange request (DNS, TLS, timeouts).
    /// A non-2xx answer shows up as [`TokenExchange`](BridgeError::TokenExchange).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// A command was issued while no upstream link is established.
    #[error("Upstream link is not connected")]
    NotConnected,

    /// Malformed or unexpected upstream payload. The string carries enough of the
    /// raw frame to diagnose it.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The code-for-token exchange was answered but unusable, e.g.
    /// `"HTTP 401: {\"message\": \"Invalid code\"}"` or a body without `access_token`.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Voice settings have not arrived from upstream yet, so there is nothing to
    /// toggle or report.
    #[error("Voice settings not available yet")]
    StateUnavailable,
}

impl BridgeError {
    /// Whether this error means the upstream link itself is gone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BridgeError::WebSocket(_)
                | BridgeError::Io(_)
                | BridgeError::ConnectionClosed
                | BridgeError::NotConnected
        )
    }
}
