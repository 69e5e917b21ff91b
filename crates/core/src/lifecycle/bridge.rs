//! Bus subscribers connecting the HTTP side to the store and the chat side.

use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::bus::{EventBus, SendMessage, SubscriptionId, GET_TICKETS, SEND_MESSAGE};
use crate::chat::ChatClient;
use crate::metrics::CHAT_FAILURES;
use crate::ticket::TicketRepository;

/// Answer `getTickets` requests with every stored ticket in wire form.
pub fn register_ticket_responders(bus: &EventBus, repository: TicketRepository) -> SubscriptionId {
    let responder = bus.clone();
    bus.on(
        GET_TICKETS,
        move |request| {
            let request = request.clone();
            let bus = responder.clone();
            let repository = repository.clone();

            let Ok(handle) = Handle::try_current() else {
                bus.respond_error(GET_TICKETS, &request, "No runtime available to load tickets");
                return;
            };
            handle.spawn(async move {
                match repository.list().await {
                    Ok(tickets) => {
                        let rows = tickets
                            .iter()
                            .map(|t| serde_json::to_value(t.to_row()))
                            .collect::<Result<Vec<Value>, _>>();
                        match rows {
                            Ok(rows) => bus.respond(GET_TICKETS, &request, Value::Array(rows)),
                            Err(e) => bus.respond_error(GET_TICKETS, &request, &e.to_string()),
                        }
                    }
                    Err(e) => bus.respond_error(GET_TICKETS, &request, &e.to_string()),
                }
            });
        },
        false,
    )
}

/// Deliver `sendmsg` events to the chat platform.
pub fn register_outbound_delivery(bus: &EventBus, chat: Arc<dyn ChatClient>) -> SubscriptionId {
    bus.on(
        SEND_MESSAGE,
        move |data| {
            let message: SendMessage = match serde_json::from_value(data.clone()) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed sendmsg event");
                    return;
                }
            };
            let Ok(handle) = Handle::try_current() else {
                warn!(channel_id = %message.channel_id, "No runtime available to deliver message");
                return;
            };
            let chat = Arc::clone(&chat);
            handle.spawn(async move {
                match chat.send_message(&message.channel_id, &message.msg).await {
                    Ok(()) => debug!(channel_id = %message.channel_id, "Delivered ticket reply"),
                    Err(e) => {
                        CHAT_FAILURES.with_label_values(&["send_message"]).inc();
                        warn!(channel_id = %message.channel_id, error = %e, "Failed to deliver ticket reply");
                    }
                }
            });
        },
        false,
    )
}
