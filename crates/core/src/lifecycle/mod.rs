//! Ticket lifecycle: intake, message recording, claim/close/reply/delete.

mod bridge;
mod engine;
mod types;

pub use bridge::{register_outbound_delivery, register_ticket_responders};
pub use engine::{channel_name, TicketDesk, CLAIM_BUTTON_ID, CLOSE_BUTTON_ID};
pub use types::*;
