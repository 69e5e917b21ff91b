//! Support tickets: the data model and the repository over storage.

mod repository;
mod types;

pub use repository::{TicketError, TicketRef, TicketRepository};
pub use types::{NewTicket, Ticket, TicketMessage, TicketRow, TicketStatus, TransitionError};
