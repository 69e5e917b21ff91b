//! Ingress for events forwarded by the chat relay.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;
use ticketdesk_core::{
    ButtonInteraction, InboundMessage, InteractionKind, InteractionReply, MessageDisposition,
};

use super::tickets::{ticket_error, ApiError};
use crate::metrics::GATEWAY_EVENTS;
use crate::state::AppState;

/// What happened to a forwarded message.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MessageOutcome {
    Ignored,
    #[serde(rename_all = "camelCase")]
    Opened {
        ticket_id: Option<i64>,
        channel_id: Option<String>,
        evicted: usize,
        errors: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Appended { ticket_id: i64 },
    /// An intake message whose ticket could not be created.
    Failed { errors: Vec<String> },
}

impl From<MessageDisposition> for MessageOutcome {
    fn from(disposition: MessageDisposition) -> Self {
        match disposition {
            MessageDisposition::Ignored => MessageOutcome::Ignored,
            MessageDisposition::Opened(report) => match report.ticket {
                Some(ticket) => MessageOutcome::Opened {
                    ticket_id: ticket.id,
                    channel_id: Some(ticket.channel_id),
                    evicted: report.evicted.len(),
                    errors: report.errors,
                },
                None => MessageOutcome::Failed {
                    errors: report.errors,
                },
            },
            MessageDisposition::Appended { ticket_id } => MessageOutcome::Appended { ticket_id },
        }
    }
}

pub async fn message(
    State(state): State<Arc<AppState>>,
    Json(message): Json<InboundMessage>,
) -> Result<(StatusCode, Json<MessageOutcome>), ApiError> {
    match state.desk().handle_message(message).await {
        Ok(disposition) => {
            let outcome = MessageOutcome::from(disposition);
            let (label, status) = match &outcome {
                MessageOutcome::Ignored => ("ignored", StatusCode::OK),
                MessageOutcome::Opened { .. } => ("opened", StatusCode::CREATED),
                MessageOutcome::Appended { .. } => ("appended", StatusCode::OK),
                MessageOutcome::Failed { .. } => ("failed", StatusCode::BAD_GATEWAY),
            };
            GATEWAY_EVENTS.with_label_values(&["message", label]).inc();
            Ok((status, Json(outcome)))
        }
        Err(e) => {
            GATEWAY_EVENTS.with_label_values(&["message", "error"]).inc();
            Err(ticket_error(e))
        }
    }
}

pub async fn interaction(
    State(state): State<Arc<AppState>>,
    Json(interaction): Json<ButtonInteraction>,
) -> Json<InteractionReply> {
    let kind = match interaction.kind {
        InteractionKind::Claim => "claim",
        InteractionKind::Close => "close",
    };
    let reply = state.desk().handle_interaction(interaction).await;
    let outcome = if reply.ephemeral { "refused" } else { "ok" };
    GATEWAY_EVENTS.with_label_values(&[kind, outcome]).inc();
    Json(reply)
}
