use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use tracing::{debug, error, info, warn};

use super::{
    ButtonInteraction, CreationReport, InboundMessage, InteractionKind, InteractionReply,
    MessageDisposition,
};
use crate::bus::{EventBus, SendMessage, SEND_MESSAGE};
use crate::chat::{
    ActionButton, ButtonStyle, ChatClient, ChatError, CreateChannelRequest, Embed, EmbedField,
};
use crate::config::DeskConfig;
use crate::metrics::{CHAT_FAILURES, TICKETS_CREATED, TICKETS_EVICTED};
use crate::ticket::{
    NewTicket, Ticket, TicketError, TicketMessage, TicketRef, TicketRepository, TicketStatus,
};

pub const CLAIM_BUTTON_ID: &str = "claim_ticket";
pub const CLOSE_BUTTON_ID: &str = "close_ticket";

/// Author recorded for replies sent from the dashboard without an identity.
const DASHBOARD_AUTHOR_ID: &str = "dashboard";
const DASHBOARD_AUTHOR_TAG: &str = "Dashboard";

static CHANNEL_NAME_INVALID: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Channel name for a ticket: `ticket-<type>-<number>` in the platform's
/// channel alphabet.
pub fn channel_name(ticket_type: &str, number: u32) -> String {
    let lowered = ticket_type.to_lowercase();
    let slug = CHANNEL_NAME_INVALID.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        format!("ticket-{}", number)
    } else {
        format!("ticket-{}-{}", slug, number)
    }
}

/// The ticket lifecycle engine.
///
/// Opens tickets from intake-channel messages, records messages posted in
/// ticket channels, and runs claim/close/reply/delete for both the chat
/// buttons and the HTTP API.
pub struct TicketDesk {
    repository: TicketRepository,
    chat: Arc<dyn ChatClient>,
    bus: EventBus,
    config: DeskConfig,
    /// Highest number handed out per ticket type. Never decreases.
    counters: Mutex<HashMap<String, u32>>,
    /// Channels of open tickets whose messages are recorded.
    watched: RwLock<HashSet<String>>,
    /// Serializes ticket creation so eviction sees a stable count.
    creation_lock: tokio::sync::Mutex<()>,
}

impl TicketDesk {
    pub fn new(
        repository: TicketRepository,
        chat: Arc<dyn ChatClient>,
        bus: EventBus,
        config: DeskConfig,
    ) -> Self {
        Self {
            repository,
            chat,
            bus,
            config,
            counters: Mutex::new(HashMap::new()),
            watched: RwLock::new(HashSet::new()),
            creation_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &TicketRepository {
        &self.repository
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &DeskConfig {
        &self.config
    }

    /// Load stored tickets, seed the per-type counters from them and watch
    /// the channels of tickets that are still open. Returns how many tickets
    /// were loaded.
    pub async fn bootstrap(&self) -> usize {
        let tickets = self.repository.load_tickets().await;

        {
            let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
            for ticket in &tickets {
                let counter = counters.entry(ticket.ticket_type.clone()).or_insert(0);
                *counter = (*counter).max(ticket.ticket_number);
            }
        }

        for ticket in tickets.iter().filter(|t| !t.status().is_closed()) {
            self.watch(&ticket.channel_id);
        }

        info!(
            tickets = tickets.len(),
            watched = self.watched_count(),
            "Ticket desk bootstrapped"
        );
        tickets.len()
    }

    /// Ticket type opened by messages in `channel_id`, if it is an intake channel.
    pub fn intake_type(&self, channel_id: &str) -> Option<&str> {
        self.config
            .intake
            .iter()
            .find(|i| i.channel_id == channel_id)
            .map(|i| i.ticket_type.as_str())
    }

    /// Whether messages in `channel_id` are recorded into a ticket.
    pub fn is_watched(&self, channel_id: &str) -> bool {
        self.watched
            .read()
            .map(|w| w.contains(channel_id))
            .unwrap_or(false)
    }

    fn watched_count(&self) -> usize {
        self.watched.read().map(|w| w.len()).unwrap_or(0)
    }

    fn watch(&self, channel_id: &str) {
        if let Ok(mut watched) = self.watched.write() {
            watched.insert(channel_id.to_string());
        }
    }

    fn unwatch(&self, channel_id: &str) {
        if let Ok(mut watched) = self.watched.write() {
            watched.remove(channel_id);
        }
    }

    fn next_number(&self, ticket_type: &str) -> u32 {
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        let counter = counters.entry(ticket_type.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Route an inbound chat message.
    pub async fn handle_message(
        &self,
        message: InboundMessage,
    ) -> Result<MessageDisposition, TicketError> {
        if message.is_bot {
            return Ok(MessageDisposition::Ignored);
        }

        if self.is_watched(&message.channel_id) {
            let entry = TicketMessage::new(
                message.author_id.clone(),
                message.author_tag.clone(),
                message.content.clone(),
                message.timestamp,
            );
            let key = TicketRef::Channel(message.channel_id.clone());
            return match self.repository.append_message(key, entry).await {
                Ok(ticket) => Ok(MessageDisposition::Appended {
                    ticket_id: ticket.id.unwrap_or_default(),
                }),
                Err(e @ (TicketError::InvalidTransition { .. } | TicketError::NotFound(_))) => {
                    debug!(channel_id = %message.channel_id, reason = %e, "Channel no longer records messages");
                    self.unwatch(&message.channel_id);
                    Ok(MessageDisposition::Ignored)
                }
                Err(e) => {
                    error!(channel_id = %message.channel_id, error = %e, "Failed to record ticket message");
                    Err(e)
                }
            };
        }

        match self.intake_type(&message.channel_id) {
            Some(ticket_type) => {
                let ticket_type = ticket_type.to_string();
                let report = self.open_ticket(&message, &ticket_type).await;
                Ok(MessageDisposition::Opened(report))
            }
            None => Ok(MessageDisposition::Ignored),
        }
    }

    /// Open a ticket of `ticket_type` for the author of `message`.
    ///
    /// Evicts the oldest tickets while the retention cap is reached. Every
    /// side effect is best-effort; failures are collected into the report
    /// and sent to the author as one direct message.
    pub async fn open_ticket(&self, message: &InboundMessage, ticket_type: &str) -> CreationReport {
        let _creation = self.creation_lock.lock().await;
        let mut report = CreationReport::default();

        let mut tickets = self.repository.load_tickets().await;
        while !tickets.is_empty() && tickets.len() >= self.config.max_tickets {
            let oldest = oldest_index(&tickets);
            let evicted = tickets.remove(oldest);
            self.evict(&evicted, &mut report.errors).await;
            report.evicted.push(evicted);
        }

        let number = self.next_number(ticket_type);
        let name = channel_name(ticket_type, number);
        let request =
            CreateChannelRequest::private_to(&self.config.guild_id, &name, &message.author_id);

        let channel_id = match self.chat.create_channel(&request).await {
            Ok(id) => id,
            Err(e) => {
                chat_failed("create_channel", &e);
                report
                    .errors
                    .push(format!("Error creating ticket channel: {}", e));
                self.report_errors(&message.author_id, &report.errors).await;
                return report;
            }
        };

        let mut ticket = Ticket::open(NewTicket {
            ticket_type: ticket_type.to_string(),
            user_id: message.author_id.clone(),
            user_tag: message.author_tag.clone(),
            ticket_number: number,
            channel_id: channel_id.clone(),
            created_at: Utc::now(),
        });

        match self.repository.save_tickets(std::slice::from_ref(&ticket)).await {
            Ok(saved) => match saved.id_for(&channel_id) {
                Some(id) => ticket.id = Some(id),
                None => {
                    let reason = saved
                        .failed
                        .first()
                        .map(|f| f.error.clone())
                        .unwrap_or_else(|| "not written".to_string());
                    report.errors.push(format!("Failed to save ticket: {}", reason));
                }
            },
            Err(e) => report.errors.push(format!("Failed to save ticket: {}", e)),
        }

        let (embed, buttons) = welcome_embed(ticket_type, &message.author_id, &message.content);
        if let Err(e) = self.chat.post_embed(&channel_id, &embed, &buttons).await {
            chat_failed("post_embed", &e);
            report
                .errors
                .push(format!("Failed to send embed to channel: {}", e));
        }

        if let Err(e) = self
            .chat
            .delete_message(&message.channel_id, &message.message_id)
            .await
        {
            chat_failed("delete_message", &e);
            report
                .errors
                .push(format!("Failed to delete original message: {}", e));
        }

        self.watch(&channel_id);
        TICKETS_CREATED.with_label_values(&[ticket_type]).inc();
        info!(
            ticket_id = ?ticket.id,
            channel_id = %channel_id,
            label = %ticket.label(),
            evicted = report.evicted.len(),
            "Ticket opened"
        );

        self.report_errors(&message.author_id, &report.errors).await;
        report.ticket = Some(ticket);
        report
    }

    async fn evict(&self, ticket: &Ticket, errors: &mut Vec<String>) {
        TICKETS_EVICTED.inc();
        self.unwatch(&ticket.channel_id);
        info!(ticket_id = ?ticket.id, label = %ticket.label(), "Evicting oldest ticket");

        if let Err(e) = self.chat.delete_channel(&ticket.channel_id).await {
            chat_failed("delete_channel", &e);
            errors.push(format!("Failed to delete oldest ticket channel: {}", e));
        }

        let Some(id) = ticket.id else {
            warn!(channel_id = %ticket.channel_id, "Oldest ticket has no id and stays in storage");
            errors.push(format!(
                "Failed to remove oldest ticket: {} has no id",
                ticket.label()
            ));
            return;
        };
        match self.repository.delete(id).await {
            Ok(_) | Err(TicketError::NotFound(_)) => {}
            Err(e) => errors.push(format!("Failed to remove oldest ticket: {}", e)),
        }
    }

    async fn report_errors(&self, user_id: &str, errors: &[String]) {
        if errors.is_empty() {
            return;
        }
        warn!(user_id, errors = ?errors, "Ticket creation finished with errors");
        let text = format!(
            "Errors occurred during ticket creation:\n{}",
            errors.join("\n")
        );
        if let Err(e) = self.chat.direct_message(user_id, &text).await {
            chat_failed("direct_message", &e);
        }
    }

    /// Handle a Claim/Close button press in a ticket channel.
    pub async fn handle_interaction(&self, interaction: ButtonInteraction) -> InteractionReply {
        let ticket = match self.repository.get_by_channel(&interaction.channel_id).await {
            Ok(Some(ticket)) => ticket,
            Ok(None) => {
                return InteractionReply::private("This ticket no longer exists in the database.")
            }
            Err(e) => {
                error!(channel_id = %interaction.channel_id, error = %e, "Failed to load ticket for interaction");
                return InteractionReply::private("There was an error handling this ticket.");
            }
        };
        let Some(id) = ticket.id else {
            return InteractionReply::private("This ticket no longer exists in the database.");
        };

        match interaction.kind {
            InteractionKind::Claim => match self.claim(id, &interaction.user_id).await {
                Ok(_) => InteractionReply::public(format!(
                    "Ticket claimed by {}.",
                    interaction.user_tag
                )),
                Err(e) => interaction_error(e),
            },
            InteractionKind::Close => {
                let reason = interaction
                    .reason
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or_default();
                if reason.is_empty() {
                    return InteractionReply::private(
                        "A closing reason is required to close this ticket.",
                    );
                }
                if let Some(claimer) = ticket.claimed_by() {
                    if claimer != interaction.user_id {
                        return InteractionReply::private(
                            "Only the claimer or an admin can close this ticket.",
                        );
                    }
                }

                match self
                    .close_from(id, &interaction.user_id, &interaction.user_tag, reason)
                    .await
                {
                    Ok(closed) => {
                        if self.config.delete_channel_on_close {
                            if let Err(e) = self.chat.delete_channel(&closed.channel_id).await {
                                chat_failed("delete_channel", &e);
                                return InteractionReply::private(
                                    "There was an error closing the ticket.",
                                );
                            }
                        }
                        InteractionReply::public(format!(
                            "Ticket {} closed by {}.",
                            closed.label(),
                            interaction.user_tag
                        ))
                    }
                    Err(e) => interaction_error(e),
                }
            }
        }
    }

    /// Claim a ticket for `user_id`.
    pub async fn claim(&self, id: i64, user_id: &str) -> Result<Ticket, TicketError> {
        self.repository.claim_ticket(id, user_id).await
    }

    /// Close a ticket from the dashboard. No claimer check.
    pub async fn close(&self, id: i64, user_id: &str, reason: &str) -> Result<Ticket, TicketError> {
        self.close_from(id, user_id, user_id, reason).await
    }

    async fn close_from(
        &self,
        id: i64,
        user_id: &str,
        user_tag: &str,
        reason: &str,
    ) -> Result<Ticket, TicketError> {
        let ticket = self.repository.close_ticket(id, user_id, reason).await?;
        self.unwatch(&ticket.channel_id);

        if let Some(log_channel) = &self.config.close_log_channel {
            let line = format!(
                "Ticket {} closed by {}. Reason: {}",
                ticket.label(),
                user_tag,
                ticket.closing_reason().unwrap_or_default()
            );
            if let Err(e) = self.chat.send_message(log_channel, &line).await {
                chat_failed("send_message", &e);
            }
        }
        Ok(ticket)
    }

    /// Append a dashboard reply to a ticket and hand it to the chat side
    /// through the bus.
    pub async fn reply(
        &self,
        id: i64,
        text: &str,
        author_id: Option<&str>,
        author_tag: Option<&str>,
    ) -> Result<Ticket, TicketError> {
        if text.trim().is_empty() {
            return Err(TicketError::Validation(
                "Reply content is required".to_string(),
            ));
        }

        let message = TicketMessage::new(
            author_id.unwrap_or(DASHBOARD_AUTHOR_ID),
            author_tag.unwrap_or(DASHBOARD_AUTHOR_TAG),
            text,
            Utc::now(),
        );
        let ticket = self
            .repository
            .append_message(TicketRef::Id(id), message)
            .await?;

        let payload = SendMessage {
            channel_id: ticket.channel_id.clone(),
            msg: text.to_string(),
        };
        match serde_json::to_value(&payload) {
            Ok(value) => self.bus.emit(SEND_MESSAGE, value),
            Err(e) => error!(ticket_id = id, error = %e, "Failed to encode reply event"),
        }
        Ok(ticket)
    }

    /// Delete a ticket and, best-effort, its channel.
    pub async fn delete_ticket(&self, id: i64) -> Result<Ticket, TicketError> {
        let ticket = self.repository.delete(id).await?;
        self.unwatch(&ticket.channel_id);
        if let Err(e) = self.chat.delete_channel(&ticket.channel_id).await {
            chat_failed("delete_channel", &e);
            warn!(ticket_id = id, error = %e, "Ticket deleted but its channel was not");
        }
        Ok(ticket)
    }
}

/// Position of the oldest ticket by creation time, then id.
fn oldest_index(tickets: &[Ticket]) -> usize {
    tickets
        .iter()
        .enumerate()
        .min_by_key(|(_, t)| (t.created_at, t.id.unwrap_or(i64::MAX)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn welcome_embed(ticket_type: &str, author_id: &str, content: &str) -> (Embed, Vec<ActionButton>) {
    let info = if content.trim().is_empty() {
        "-".to_string()
    } else {
        content.to_string()
    };
    let embed = Embed {
        title: "Ticket".to_string(),
        color: None,
        fields: vec![
            EmbedField {
                name: "Typ".to_string(),
                value: ticket_type.to_string(),
                inline: false,
            },
            EmbedField {
                name: "Author".to_string(),
                value: format!("<@{}>", author_id),
                inline: false,
            },
            EmbedField {
                name: "Info".to_string(),
                value: info,
                inline: false,
            },
        ],
    };
    let buttons = vec![
        ActionButton {
            custom_id: CLAIM_BUTTON_ID.to_string(),
            label: "Claim".to_string(),
            style: ButtonStyle::Primary,
        },
        ActionButton {
            custom_id: CLOSE_BUTTON_ID.to_string(),
            label: "Close".to_string(),
            style: ButtonStyle::Danger,
        },
    ];
    (embed, buttons)
}

fn interaction_error(e: TicketError) -> InteractionReply {
    match e {
        TicketError::InvalidTransition {
            current: TicketStatus::Claimed,
            ..
        } => InteractionReply::private("This ticket is already claimed."),
        TicketError::InvalidTransition {
            current: TicketStatus::Closed,
            ..
        } => InteractionReply::private("This ticket is already closed."),
        TicketError::NotFound(_) => {
            InteractionReply::private("This ticket no longer exists in the database.")
        }
        other => {
            error!(error = %other, "Ticket interaction failed");
            InteractionReply::private("There was an error handling this ticket.")
        }
    }
}

fn chat_failed(call: &str, e: &ChatError) {
    CHAT_FAILURES.with_label_values(&[call]).inc();
    warn!(call, error = %e, "Chat call failed");
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_name("Pomoc", 3), "ticket-pomoc-3");
        assert_eq!(channel_name("Bug Report!", 1), "ticket-bug-report-1");
        assert_eq!(channel_name("Zgłoszenie", 2), "ticket-zg-oszenie-2");
        assert_eq!(channel_name("!!", 9), "ticket-9");
    }

    #[test]
    fn test_oldest_index_uses_created_at() {
        let now = Utc::now();
        let make = |channel: &str, offset: i64| {
            let mut t = Ticket::open(NewTicket {
                ticket_type: "Pomoc".to_string(),
                user_id: "U1".to_string(),
                user_tag: "u#1".to_string(),
                ticket_number: 1,
                channel_id: channel.to_string(),
                created_at: now + Duration::minutes(offset),
            });
            t.id = Some(offset + 10);
            t
        };
        let tickets = vec![make("C1", 5), make("C2", -3), make("C3", 0)];
        assert_eq!(oldest_index(&tickets), 1);
    }

    #[test]
    fn test_welcome_embed_layout() {
        let (embed, buttons) = welcome_embed("Pomoc", "U1", "need help");
        assert_eq!(embed.title, "Ticket");
        let names: Vec<_> = embed.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Typ", "Author", "Info"]);
        assert_eq!(embed.fields[1].value, "<@U1>");
        assert_eq!(buttons[0].custom_id, "claim_ticket");
        assert_eq!(buttons[1].style, ButtonStyle::Danger);
    }

    #[test]
    fn test_interaction_error_messages() {
        let claimed = TicketError::InvalidTransition {
            ticket_id: 1,
            current: TicketStatus::Claimed,
            operation: "claim",
        };
        assert_eq!(
            interaction_error(claimed),
            InteractionReply::private("This ticket is already claimed.")
        );
    }
}
