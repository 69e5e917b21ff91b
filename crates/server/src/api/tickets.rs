//! Ticket API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use ticketdesk_core::{BusError, Ticket, TicketError, TicketRow, GET_TICKETS};

use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for claiming a ticket
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTicketBody {
    pub user_id: String,
}

/// Request body for closing a ticket
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTicketBody {
    pub user_id: String,
    #[serde(default)]
    pub reason: String,
}

/// Request body for replying to a ticket
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTicketBody {
    #[serde(default)]
    pub reply: String,
    pub author_id: Option<String>,
    pub author_tag: Option<String>,
}

/// Response for ticket mutations
#[derive(Debug, Serialize)]
pub struct TicketActionResponse {
    pub message: String,
    pub ticket: TicketRow,
}

impl TicketActionResponse {
    fn new(message: impl Into<String>, ticket: &Ticket) -> Json<Self> {
        Json(Self {
            message: message.into(),
            ticket: ticket.to_row(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct TicketErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<TicketErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(TicketErrorResponse {
            error: error.into(),
        }),
    )
}

pub(crate) fn ticket_error(e: TicketError) -> ApiError {
    let status = match &e {
        TicketError::NotFound(_) => StatusCode::NOT_FOUND,
        TicketError::InvalidTransition { .. } => StatusCode::CONFLICT,
        TicketError::Validation(_) => StatusCode::BAD_REQUEST,
        TicketError::Storage(_) => {
            tracing::error!(error = %e, "Ticket storage failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let message = match &e {
        TicketError::Validation(message) => message.clone(),
        other => other.to_string(),
    };
    api_error(status, message)
}

fn bus_error(e: BusError) -> ApiError {
    match e {
        BusError::Timeout { .. } => api_error(StatusCode::GATEWAY_TIMEOUT, e.to_string()),
        BusError::Remote { .. } => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Ask the ticket responder on the bus for every stored ticket.
async fn fetch_tickets(state: &AppState) -> Result<Vec<Value>, ApiError> {
    let response = state
        .bus()
        .request(GET_TICKETS, json!({}), state.bus_timeout())
        .await
        .map_err(bus_error)?;
    match response {
        Value::Array(rows) => Ok(rows),
        other => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Unexpected getTickets response: {}", other),
        )),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// List every ticket
pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Value>>, ApiError> {
    fetch_tickets(&state).await.map(Json)
}

/// Number of stored tickets
pub async fn count_tickets(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CountResponse>, ApiError> {
    let tickets = fetch_tickets(&state).await?;
    Ok(Json(CountResponse {
        count: tickets.len(),
    }))
}

/// Get a ticket by ID
pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TicketRow>, ApiError> {
    let ticket = state.repository().get(id).await.map_err(ticket_error)?;
    Ok(Json(ticket.to_row()))
}

/// Delete a ticket and its channel
pub async fn delete_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TicketActionResponse>, ApiError> {
    let ticket = state.desk().delete_ticket(id).await.map_err(ticket_error)?;
    Ok(TicketActionResponse::new("Ticket deleted", &ticket))
}

pub async fn claim_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ClaimTicketBody>,
) -> Result<Json<TicketActionResponse>, ApiError> {
    let ticket = state
        .desk()
        .claim(id, &body.user_id)
        .await
        .map_err(ticket_error)?;
    Ok(TicketActionResponse::new("Ticket claimed", &ticket))
}

pub async fn close_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<CloseTicketBody>,
) -> Result<Json<TicketActionResponse>, ApiError> {
    let ticket = state
        .desk()
        .close(id, &body.user_id, &body.reason)
        .await
        .map_err(ticket_error)?;
    Ok(TicketActionResponse::new("Ticket closed", &ticket))
}

/// Append a reply and deliver it to the ticket channel
pub async fn reply_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ReplyTicketBody>,
) -> Result<Json<TicketActionResponse>, ApiError> {
    let ticket = state
        .desk()
        .reply(
            id,
            &body.reply,
            body.author_id.as_deref(),
            body.author_tag.as_deref(),
        )
        .await
        .map_err(ticket_error)?;
    Ok(TicketActionResponse::new("Reply sent", &ticket))
}
