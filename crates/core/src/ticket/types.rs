//! Core ticket data types.

use std::fmt;

use chrono::{DateTime, DurationRound, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Status
// ============================================================================

/// Ticket status, always derived from `closed_by` and `claimed_by`.
///
/// The numeric codes are the values persisted in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Closed,
    Claimed,
    Unclaimed,
}

impl TicketStatus {
    /// Derive the status from the two lifecycle fields.
    pub fn derive(closed_by: Option<&str>, claimed_by: Option<&str>) -> Self {
        if closed_by.is_some() {
            TicketStatus::Closed
        } else if claimed_by.is_some() {
            TicketStatus::Claimed
        } else {
            TicketStatus::Unclaimed
        }
    }

    /// Stored integer code: 0 = closed, 1 = claimed, 2 = unclaimed.
    pub fn code(&self) -> i64 {
        match self {
            TicketStatus::Closed => 0,
            TicketStatus::Claimed => 1,
            TicketStatus::Unclaimed => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TicketStatus::Closed),
            1 => Some(TicketStatus::Claimed),
            2 => Some(TicketStatus::Unclaimed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Closed => "closed",
            TicketStatus::Claimed => "claimed",
            TicketStatus::Unclaimed => "unclaimed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TicketStatus::Closed)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Messages
// ============================================================================

/// One message posted inside a ticket channel (or replied from the dashboard).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketMessage {
    pub author_id: String,
    pub author_tag: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TicketMessage {
    pub fn new(
        author_id: impl Into<String>,
        author_tag: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            author_id: author_id.into(),
            author_tag: author_tag.into(),
            content: content.into(),
            timestamp: to_millis(timestamp),
        }
    }
}

/// Timestamps are kept at millisecond precision, the precision every
/// backend stores.
fn to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(chrono::Duration::milliseconds(1))
        .unwrap_or(ts)
}

// ============================================================================
// Transitions
// ============================================================================

/// A lifecycle operation that the current status does not allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub current: TicketStatus,
    pub operation: &'static str,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot {} a ticket that is {}",
            self.operation, self.current
        )
    }
}

impl std::error::Error for TransitionError {}

// ============================================================================
// Ticket
// ============================================================================

/// A support ticket.
///
/// The lifecycle fields are private: they only change through [`Ticket::claim`]
/// and [`Ticket::close`], so [`Ticket::status`] can never disagree with them.
/// Messages are append-only through [`Ticket::push_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    /// Assigned by storage on first persist.
    pub id: Option<i64>,
    pub ticket_type: String,
    pub user_id: String,
    pub user_tag: String,
    /// Sequential number scoped to `ticket_type`.
    pub ticket_number: u32,
    /// Natural key used for upserts.
    pub channel_id: String,
    pub created_at: DateTime<Utc>,
    claimed_by: Option<String>,
    closed_by: Option<String>,
    closing_reason: Option<String>,
    messages: Vec<TicketMessage>,
}

/// Data needed to open a ticket.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub ticket_type: String,
    pub user_id: String,
    pub user_tag: String,
    pub ticket_number: u32,
    pub channel_id: String,
    pub created_at: DateTime<Utc>,
}

impl Ticket {
    /// Open a fresh, unclaimed ticket with no messages.
    pub fn open(new: NewTicket) -> Self {
        Self {
            id: None,
            ticket_type: new.ticket_type,
            user_id: new.user_id,
            user_tag: new.user_tag,
            ticket_number: new.ticket_number,
            channel_id: new.channel_id,
            created_at: to_millis(new.created_at),
            claimed_by: None,
            closed_by: None,
            closing_reason: None,
            messages: Vec::new(),
        }
    }

    pub fn status(&self) -> TicketStatus {
        TicketStatus::derive(self.closed_by.as_deref(), self.claimed_by.as_deref())
    }

    pub fn claimed_by(&self) -> Option<&str> {
        self.claimed_by.as_deref()
    }

    pub fn closed_by(&self) -> Option<&str> {
        self.closed_by.as_deref()
    }

    pub fn closing_reason(&self) -> Option<&str> {
        self.closing_reason.as_deref()
    }

    pub fn messages(&self) -> &[TicketMessage] {
        &self.messages
    }

    /// Human-facing label, e.g. `Pomoc-3`.
    pub fn label(&self) -> String {
        format!("{}-{}", self.ticket_type, self.ticket_number)
    }

    /// Distinct message authors in order of first appearance.
    pub fn participants(&self) -> Vec<String> {
        let mut users: Vec<String> = Vec::new();
        for message in &self.messages {
            if !message.author_id.is_empty() && !users.contains(&message.author_id) {
                users.push(message.author_id.clone());
            }
        }
        users
    }

    /// Assign a staff member. Only an unclaimed ticket can be claimed.
    pub fn claim(&mut self, user_id: impl Into<String>) -> Result<(), TransitionError> {
        match self.status() {
            TicketStatus::Unclaimed => {
                self.claimed_by = Some(user_id.into());
                Ok(())
            }
            current => Err(TransitionError {
                current,
                operation: "claim",
            }),
        }
    }

    /// Close the ticket. Claiming first is not required; closed is terminal.
    pub fn close(
        &mut self,
        user_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), TransitionError> {
        match self.status() {
            TicketStatus::Closed => Err(TransitionError {
                current: TicketStatus::Closed,
                operation: "close",
            }),
            _ => {
                self.closed_by = Some(user_id.into());
                self.closing_reason = Some(reason.into());
                Ok(())
            }
        }
    }

    /// Append a message. Closed tickets no longer accept messages.
    pub fn push_message(&mut self, message: TicketMessage) -> Result<(), TransitionError> {
        if self.status().is_closed() {
            return Err(TransitionError {
                current: TicketStatus::Closed,
                operation: "add a message to",
            });
        }
        self.messages.push(message);
        Ok(())
    }

    /// Rebuild a ticket from its storage row.
    ///
    /// The stored status is ignored; callers compare it with [`Ticket::status`]
    /// to find rows that need healing.
    pub fn from_row(row: TicketRow) -> Self {
        Self {
            id: row.id,
            ticket_type: row.ticket_type,
            user_id: row.user_id,
            user_tag: row.user_tag,
            ticket_number: row.ticket_number,
            channel_id: row.channel_id,
            created_at: row.created_at,
            claimed_by: row.claimed_by.filter(|s| !s.is_empty()),
            closed_by: row.closed_by.filter(|s| !s.is_empty()),
            closing_reason: row.closing_reason.filter(|s| !s.is_empty()),
            messages: row.messages,
        }
    }

    pub fn to_row(&self) -> TicketRow {
        TicketRow::from(self)
    }
}

// ============================================================================
// Storage row
// ============================================================================

/// Storage representation shared by every backend.
///
/// This is also the JSON file format: an array of these objects with
/// camelCase keys. `status` and `users` are projections written from the
/// ticket on every save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketRow {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "type")]
    pub ticket_type: String,
    pub user_id: String,
    #[serde(default)]
    pub user_tag: String,
    #[serde(default)]
    pub ticket_number: u32,
    #[serde(default)]
    pub status: Option<i64>,
    pub channel_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub closed_by: Option<String>,
    #[serde(default)]
    pub closing_reason: Option<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub messages: Vec<TicketMessage>,
}

impl TicketRow {
    /// True when the stored status disagrees with the derived one.
    pub fn has_stale_status(&self) -> bool {
        let derived = TicketStatus::derive(
            self.closed_by.as_deref().filter(|s| !s.is_empty()),
            self.claimed_by.as_deref().filter(|s| !s.is_empty()),
        );
        self.status != Some(derived.code())
    }
}

impl From<&Ticket> for TicketRow {
    fn from(ticket: &Ticket) -> Self {
        Self {
            id: ticket.id,
            ticket_type: ticket.ticket_type.clone(),
            user_id: ticket.user_id.clone(),
            user_tag: ticket.user_tag.clone(),
            ticket_number: ticket.ticket_number,
            status: Some(ticket.status().code()),
            channel_id: ticket.channel_id.clone(),
            created_at: ticket.created_at,
            claimed_by: ticket.claimed_by.clone(),
            closed_by: ticket.closed_by.clone(),
            closing_reason: ticket.closing_reason.clone(),
            users: ticket.participants(),
            messages: ticket.messages.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_ticket_data() -> NewTicket {
        NewTicket {
            ticket_type: "Pomoc".to_string(),
            user_id: "U1".to_string(),
            user_tag: "user#0001".to_string(),
            ticket_number: 1,
            channel_id: "C1".to_string(),
            created_at: Utc::now(),
        }
    }

    fn new_ticket() -> Ticket {
        Ticket::open(new_ticket_data())
    }

    fn message(author: &str, content: &str) -> TicketMessage {
        TicketMessage::new(author, format!("{author}#tag"), content, Utc::now())
    }

    #[test]
    fn test_timestamps_are_kept_to_the_millisecond() {
        let precise = DateTime::parse_from_rfc3339("2026-10-18T09:58:16.532481189Z")
            .unwrap()
            .with_timezone(&Utc);
        let expected = DateTime::parse_from_rfc3339("2026-10-18T09:58:16.532Z")
            .unwrap()
            .with_timezone(&Utc);

        let ticket = Ticket::open(NewTicket {
            created_at: precise,
            ..new_ticket_data()
        });
        assert_eq!(ticket.created_at, expected);

        let msg = TicketMessage::new("U1", "user#0001", "hi", precise);
        assert_eq!(msg.timestamp, expected);
    }

    #[test]
    fn test_status_derivation_table() {
        assert_eq!(TicketStatus::derive(None, None), TicketStatus::Unclaimed);
        assert_eq!(TicketStatus::derive(None, Some("S1")), TicketStatus::Claimed);
        assert_eq!(TicketStatus::derive(Some("S1"), None), TicketStatus::Closed);
        assert_eq!(
            TicketStatus::derive(Some("S1"), Some("S2")),
            TicketStatus::Closed
        );
    }

    #[test]
    fn test_status_codes_roundtrip() {
        for status in [
            TicketStatus::Closed,
            TicketStatus::Claimed,
            TicketStatus::Unclaimed,
        ] {
            assert_eq!(TicketStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(TicketStatus::from_code(7), None);
    }

    #[test]
    fn test_new_ticket_is_unclaimed() {
        let ticket = new_ticket();
        assert_eq!(ticket.status(), TicketStatus::Unclaimed);
        assert_eq!(ticket.status().code(), 2);
        assert!(ticket.messages().is_empty());
        assert_eq!(ticket.label(), "Pomoc-1");
    }

    #[test]
    fn test_claim_then_close() {
        let mut ticket = new_ticket();
        ticket.claim("S1").unwrap();
        assert_eq!(ticket.status(), TicketStatus::Claimed);
        assert_eq!(ticket.claimed_by(), Some("S1"));

        ticket.close("S1", "resolved").unwrap();
        assert_eq!(ticket.status(), TicketStatus::Closed);
        assert_eq!(ticket.closed_by(), Some("S1"));
        assert_eq!(ticket.closing_reason(), Some("resolved"));
    }

    #[test]
    fn test_close_without_claim_is_allowed() {
        let mut ticket = new_ticket();
        ticket.close("S1", "spam").unwrap();
        assert_eq!(ticket.status(), TicketStatus::Closed);
        assert_eq!(ticket.claimed_by(), None);
    }

    #[test]
    fn test_double_claim_rejected() {
        let mut ticket = new_ticket();
        ticket.claim("S1").unwrap();
        let err = ticket.claim("S2").unwrap_err();
        assert_eq!(err.current, TicketStatus::Claimed);
        assert_eq!(ticket.claimed_by(), Some("S1"));
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut ticket = new_ticket();
        ticket.close("S1", "done").unwrap();
        assert!(ticket.claim("S2").is_err());
        assert!(ticket.close("S2", "again").is_err());
        assert!(ticket.push_message(message("U1", "hello?")).is_err());
        assert_eq!(ticket.closing_reason(), Some("done"));
    }

    #[test]
    fn test_participants_are_unique_in_first_seen_order() {
        let mut ticket = new_ticket();
        ticket.push_message(message("U1", "need help")).unwrap();
        ticket.push_message(message("S1", "on it")).unwrap();
        ticket.push_message(message("U1", "thanks")).unwrap();

        assert_eq!(ticket.participants(), vec!["U1", "S1"]);
        assert_eq!(ticket.messages().len(), 3);
        assert_eq!(ticket.messages()[2].content, "thanks");
    }

    #[test]
    fn test_row_projection_writes_derived_fields() {
        let mut ticket = new_ticket();
        ticket.push_message(message("U1", "hi")).unwrap();
        ticket.claim("S1").unwrap();

        let row = ticket.to_row();
        assert_eq!(row.status, Some(1));
        assert_eq!(row.users, vec!["U1"]);
        assert!(!row.has_stale_status());

        let back = Ticket::from_row(row);
        assert_eq!(back, ticket);
    }

    #[test]
    fn test_stale_row_detection() {
        let mut row = new_ticket().to_row();
        row.closed_by = Some("S1".to_string());
        assert!(row.has_stale_status());

        let ticket = Ticket::from_row(row);
        assert_eq!(ticket.status(), TicketStatus::Closed);
    }

    #[test]
    fn test_row_json_uses_camel_case_and_type_key() {
        let row = new_ticket().to_row();
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["type"], "Pomoc");
        assert_eq!(json["channelId"], "C1");
        assert_eq!(json["ticketNumber"], 1);
        assert_eq!(json["status"], 2);
        assert!(json["claimedBy"].is_null());
    }

    #[test]
    fn test_row_json_tolerates_legacy_fields() {
        let json = r#"{
            "type": "Pytanie",
            "userId": "U9",
            "userTag": "u#9",
            "ticketNumber": 4,
            "channelId": "C9",
            "createdAt": "2025-03-26T10:00:00.000Z",
            "claimedBy": null,
            "closedBy": null,
            "replies": ["legacy"]
        }"#;
        let row: TicketRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.id, None);
        assert_eq!(row.status, None);
        assert!(row.messages.is_empty());
        assert!(row.has_stale_status());
    }

    #[test]
    fn test_empty_strings_treated_as_absent() {
        let mut row = new_ticket().to_row();
        row.claimed_by = Some(String::new());
        let ticket = Ticket::from_row(row);
        assert_eq!(ticket.status(), TicketStatus::Unclaimed);
    }
}
