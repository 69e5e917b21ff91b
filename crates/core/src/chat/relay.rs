//! Chat client that forwards every call to the gateway relay over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::ChatConfig;

use super::{ActionButton, ChatClient, ChatError, CreateChannelRequest, Embed};

/// Relay-backed chat client.
pub struct RelayChatClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedChannel {
    id: String,
}

impl RelayChatClient {
    pub fn new(config: &ChatConfig) -> Result<Self, ChatError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatError::ConnectionFailed(e.to_string()))?;

        let base_url = Url::parse(&config.relay_url)
            .map_err(|e| ChatError::InvalidUrl(format!("{}: {}", config.relay_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::InvalidUrl(config.relay_url.clone()));
        }

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
        })
    }

    /// Relay endpoint for `segments`; each segment is percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send a request, mapping transport failures and non-2xx statuses.
    async fn send(&self, request: RequestBuilder) -> Result<Response, ChatError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ChatError::Timeout
            } else if e.is_connect() {
                ChatError::ConnectionFailed(e.to_string())
            } else {
                ChatError::InvalidResponse(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Api {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatClient for RelayChatClient {
    async fn create_channel(&self, request: &CreateChannelRequest) -> Result<String, ChatError> {
        let response = self
            .send(self.client.post(self.url(&["channels"])?).json(request))
            .await?;
        let created: CreatedChannel = response
            .json()
            .await
            .map_err(|e| ChatError::InvalidResponse(e.to_string()))?;
        debug!(channel_id = %created.id, name = %request.name, "Created channel");
        Ok(created.id)
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<(), ChatError> {
        self.send(self.client.delete(self.url(&["channels", channel_id])?))
            .await?;
        Ok(())
    }

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<(), ChatError> {
        self.send(
            self.client
                .post(self.url(&["channels", channel_id, "messages"])?)
                .json(&json!({ "content": text })),
        )
        .await?;
        Ok(())
    }

    async fn post_embed(
        &self,
        channel_id: &str,
        embed: &Embed,
        buttons: &[ActionButton],
    ) -> Result<(), ChatError> {
        self.send(
            self.client
                .post(self.url(&["channels", channel_id, "messages"])?)
                .json(&json!({ "embed": embed, "buttons": buttons })),
        )
        .await?;
        Ok(())
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChatError> {
        self.send(
            self.client
                .delete(self.url(&["channels", channel_id, "messages", message_id])?),
        )
        .await?;
        Ok(())
    }

    async fn direct_message(&self, user_id: &str, text: &str) -> Result<(), ChatError> {
        self.send(
            self.client
                .post(self.url(&["users", user_id, "dm"])?)
                .json(&json!({ "content": text })),
        )
        .await?;
        Ok(())
    }
}
