//! Testing utilities and mock implementations.
//!
//! These stand in for the chat relay and the storage backends so the
//! lifecycle engine and the HTTP API can be exercised without a chat
//! platform or a database server.
//!
//! # Example
//!
//! ```rust,ignore
//! use ticketdesk_core::testing::{MockChatClient, ChatCall};
//!
//! let chat = Arc::new(MockChatClient::new());
//! chat.fail_on("post_embed");
//!
//! // Drive a TicketDesk built with `chat.clone()`...
//!
//! assert!(chat.calls().iter().any(|c| matches!(c, ChatCall::DirectMessage { .. })));
//! ```

mod failing_backend;
mod mock_chat;

pub use failing_backend::FailingBackend;
pub use mock_chat::{ChatCall, MockChatClient};

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::Utc;

    use crate::config::{DeskConfig, IntakeChannel};
    use crate::lifecycle::InboundMessage;

    /// Desk configuration with one intake channel per `(channel, type)` pair.
    pub fn desk_config(intake: &[(&str, &str)]) -> DeskConfig {
        DeskConfig {
            guild_id: "G1".to_string(),
            intake: intake
                .iter()
                .map(|(channel_id, ticket_type)| IntakeChannel {
                    channel_id: channel_id.to_string(),
                    ticket_type: ticket_type.to_string(),
                })
                .collect(),
            close_log_channel: Some("LOG".to_string()),
            ..DeskConfig::default()
        }
    }

    /// A user message posted in `channel_id`.
    pub fn message(channel_id: &str, author_id: &str, content: &str) -> InboundMessage {
        InboundMessage {
            message_id: format!("M-{}-{}", channel_id, content.len()),
            channel_id: channel_id.to_string(),
            author_id: author_id.to_string(),
            author_tag: format!("{}#0001", author_id.to_lowercase()),
            content: content.to_string(),
            is_bot: false,
            timestamp: Utc::now(),
        }
    }
}
