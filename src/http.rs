use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;

use crate::error::BridgeError;

pub const DEFAULT_TOKEN_URL: &str = "https://streamkit.discord.com/overlay/token";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Out-of-band half of the RPC handshake: trades the code returned by
/// `AUTHORIZE` for an access token.
pub struct Http {
    client: reqwest::Client,
    pub token_url: String,
}

impl Http {
    pub fn new(token_url: impl Into<String>) -> Result<Self, BridgeError> {
        install_crypto_provider();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            client: reqwest::Client::builder()
                .default_headers(headers)
                .timeout(REQUEST_TIMEOUT)
                .build()?,
            token_url: token_url.into(),
        })
    }

    pub async fn exchange_code(&self, code: &str) -> Result<String, BridgeError> {
        let body = json!({ "code": code });
        let response = self.client.post(&self.token_url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BridgeError::TokenExchange(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }

        let token: TokenResponse = response.json().await?;
        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BridgeError::TokenExchange("response carried no access_token".into()))
    }
}

/// rustls needs a process-wide provider once more than one backend is compiled in.
/// Installing twice is harmless; the second attempt is simply refused.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
