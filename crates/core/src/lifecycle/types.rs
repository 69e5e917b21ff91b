use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ticket::Ticket;

/// A chat message delivered by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_tag: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Claim,
    Close,
}

/// A Claim/Close button press in a ticket channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonInteraction {
    pub kind: InteractionKind,
    pub channel_id: String,
    pub user_id: String,
    pub user_tag: String,
    /// Closing reason collected by the relay's modal.
    #[serde(default)]
    pub reason: Option<String>,
}

/// What the gateway should answer to a button press.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionReply {
    pub content: String,
    /// Visible only to the user who pressed the button.
    pub ephemeral: bool,
}

impl InteractionReply {
    pub fn public(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ephemeral: false,
        }
    }

    pub fn private(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ephemeral: true,
        }
    }
}

/// Outcome of opening a ticket. Creation is best-effort: side effects that
/// failed are listed in `errors` and the ticket is kept anyway.
#[derive(Debug, Clone, Default)]
pub struct CreationReport {
    /// `None` only when the ticket channel could not be created.
    pub ticket: Option<Ticket>,
    pub evicted: Vec<Ticket>,
    pub errors: Vec<String>,
}

/// What [`super::TicketDesk::handle_message`] did with a message.
#[derive(Debug, Clone)]
pub enum MessageDisposition {
    Ignored,
    Opened(CreationReport),
    Appended { ticket_id: i64 },
}
