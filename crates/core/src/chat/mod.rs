//! Outbound chat-platform operations.
//!
//! The desk never talks to the chat platform directly. It goes through a
//! [`ChatClient`]; in production that is the [`RelayChatClient`], which
//! forwards calls to the gateway relay process owning the platform session.

mod relay;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use relay::RelayChatClient;

/// Errors from chat operations.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Chat API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),
}

/// A channel permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    ViewChannel,
    SendMessages,
    ReadMessageHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwriteKind {
    Role,
    Member,
}

/// Per-role or per-member permission override on a new channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOverwrite {
    pub id: String,
    pub kind: OverwriteKind,
    #[serde(default)]
    pub allow: Vec<Permission>,
    #[serde(default)]
    pub deny: Vec<Permission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelRequest {
    pub guild_id: String,
    pub name: String,
    pub overwrites: Vec<PermissionOverwrite>,
}

impl CreateChannelRequest {
    /// A channel hidden from the guild and open to one member.
    ///
    /// The guild's default role shares the guild id.
    pub fn private_to(guild_id: &str, name: &str, user_id: &str) -> Self {
        Self {
            guild_id: guild_id.to_string(),
            name: name.to_string(),
            overwrites: vec![
                PermissionOverwrite {
                    id: guild_id.to_string(),
                    kind: OverwriteKind::Role,
                    allow: Vec::new(),
                    deny: vec![Permission::ViewChannel],
                },
                PermissionOverwrite {
                    id: user_id.to_string(),
                    kind: OverwriteKind::Member,
                    allow: vec![
                        Permission::ViewChannel,
                        Permission::SendMessages,
                        Permission::ReadMessageHistory,
                    ],
                    deny: Vec::new(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonStyle {
    Primary,
    Secondary,
    Success,
    Danger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionButton {
    pub custom_id: String,
    pub label: String,
    pub style: ButtonStyle,
}

/// Chat-platform operations the desk depends on.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Create a channel and return its id.
    async fn create_channel(&self, request: &CreateChannelRequest) -> Result<String, ChatError>;

    async fn delete_channel(&self, channel_id: &str) -> Result<(), ChatError>;

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<(), ChatError>;

    async fn post_embed(
        &self,
        channel_id: &str,
        embed: &Embed,
        buttons: &[ActionButton],
    ) -> Result<(), ChatError>;

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChatError>;

    async fn direct_message(&self, user_id: &str, text: &str) -> Result<(), ChatError>;
}
