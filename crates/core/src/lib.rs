pub mod bus;
pub mod chat;
pub mod config;
pub mod lifecycle;
pub mod metrics;
pub mod storage;
pub mod testing;
pub mod ticket;

pub use bus::{BusError, EventBus, SendMessage, GET_TICKETS, SEND_MESSAGE};
pub use chat::{ChatClient, ChatError, RelayChatClient};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, DeskConfig,
    SanitizedConfig, StorageBackendKind,
};
pub use lifecycle::{
    register_outbound_delivery, register_ticket_responders, ButtonInteraction, InboundMessage,
    InteractionKind, InteractionReply, MessageDisposition, TicketDesk,
};
pub use storage::{create_backend, StorageBackend, StorageError, WriteQueue};
pub use ticket::{
    Ticket, TicketError, TicketMessage, TicketRef, TicketRepository, TicketRow, TicketStatus,
};
