//! [`Transport`] over the Telegram Bot API `sendMessage` method.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use postdigest_shared::{PostDigestError, RecipientId, Result};

use crate::traits::Transport;

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Bot API client. Holds the token, so it deliberately has no `Debug`.
pub struct TelegramTransport {
    client: Client,
    api_base: String,
    token: String,
}

impl TelegramTransport {
    /// `api_base` is normally `https://api.telegram.org`.
    pub fn new(api_base: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PostDigestError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    #[instrument(skip_all, fields(%recipient, chars = text.chars().count()))]
    async fn send(&self, recipient: &RecipientId, text: &str) -> Result<()> {
        let body = SendMessage {
            chat_id: recipient.as_str(),
            text,
            disable_web_page_preview: true,
        };

        // Errors are stripped of the URL, which embeds the token
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| PostDigestError::send(recipient.as_str(), e.without_url().to_string()))?;

        let status = response.status();
        let parsed: Option<ApiResponse> = response.json().await.ok();

        match parsed {
            Some(ApiResponse { ok: true, .. }) => {
                debug!("message accepted");
                Ok(())
            }
            Some(ApiResponse { description, .. }) => Err(PostDigestError::send(
                recipient.as_str(),
                description.unwrap_or_else(|| format!("HTTP {status}")),
            )),
            None => Err(PostDigestError::send(
                recipient.as_str(),
                format!("HTTP {status}, unreadable response"),
            )),
        }
    }
}
