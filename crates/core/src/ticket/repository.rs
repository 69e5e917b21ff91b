use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::{Ticket, TicketMessage, TicketStatus, TransitionError};
use crate::config::StorageBackendKind;
use crate::metrics::{observe_storage, STATUS_REPAIRS, TICKET_TRANSITIONS};
use crate::storage::{QueryResult, SqlValue, StorageBackend, StorageError, UpsertReport, WriteQueue};

/// How a caller identifies a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketRef {
    Id(i64),
    Channel(String),
}

impl fmt::Display for TicketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketRef::Id(id) => write!(f, "id {}", id),
            TicketRef::Channel(channel) => write!(f, "channel {}", channel),
        }
    }
}

/// Errors from ticket operations.
#[derive(Debug, Error)]
pub enum TicketError {
    #[error("Ticket not found: {0}")]
    NotFound(TicketRef),

    #[error("Cannot {operation} ticket {ticket_id}: it is {current}")]
    InvalidTransition {
        ticket_id: i64,
        current: TicketStatus,
        operation: &'static str,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TicketError {
    fn transition(ticket: &Ticket, e: TransitionError) -> Self {
        TicketError::InvalidTransition {
            ticket_id: ticket.id.unwrap_or_default(),
            current: e.current,
            operation: e.operation,
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            TicketError::NotFound(_) => "not_found",
            TicketError::InvalidTransition { .. } | TicketError::Validation(_) => "rejected",
            TicketError::Storage(_) => "error",
        }
    }
}

/// Domain-level ticket operations over the active backend.
///
/// Every mutation runs as one job on the [`WriteQueue`]: the row is read,
/// changed through [`Ticket`] and written back without another write
/// interleaving. Reads go straight to the backend.
#[derive(Clone)]
pub struct TicketRepository {
    backend: Arc<dyn StorageBackend>,
    queue: WriteQueue,
}

impl TicketRepository {
    pub fn new(backend: Arc<dyn StorageBackend>, queue: WriteQueue) -> Self {
        Self { backend, queue }
    }

    pub fn backend_kind(&self) -> StorageBackendKind {
        self.backend.kind()
    }

    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    fn observe<T>(&self, operation: &str, result: &Result<T, StorageError>) {
        observe_storage(self.backend.kind().as_str(), operation, result);
    }

    /// Load every ticket, repairing rows whose stored status is stale.
    ///
    /// A storage failure yields an empty list rather than an error.
    pub async fn load_tickets(&self) -> Vec<Ticket> {
        let result = self.backend.load_all().await;
        self.observe("load_all", &result);
        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load tickets, continuing with none");
                return Vec::new();
            }
        };

        let mut tickets = Vec::with_capacity(rows.len());
        for row in rows {
            let stale = row.has_stale_status();
            let ticket = Ticket::from_row(row);
            if stale {
                if let Some(id) = ticket.id {
                    if let Err(e) = self.update_ticket_status(id).await {
                        tracing::warn!(ticket_id = id, error = %e, "Failed to repair ticket status");
                    }
                }
            }
            tickets.push(ticket);
        }
        tickets
    }

    /// Upsert a batch keyed by channel. Tickets not in the batch are left
    /// alone; a ticket that fails to save is reported, not fatal.
    pub async fn save_tickets(&self, tickets: &[Ticket]) -> Result<UpsertReport, TicketError> {
        let rows: Vec<_> = tickets.iter().map(Ticket::to_row).collect();
        let result = self
            .queue
            .enqueue(move |backend| async move { backend.upsert_many(&rows).await })
            .await;
        self.observe("upsert_many", &result);
        let report = result?;

        if !report.is_complete() {
            tracing::warn!(
                saved = report.saved.len(),
                failed = report.failed.len(),
                "Ticket batch saved partially"
            );
        }
        Ok(report)
    }

    /// Re-read one row and rewrite its status from `closedBy`/`claimedBy`
    /// if the stored value disagrees.
    pub async fn update_ticket_status(&self, id: i64) -> Result<TicketStatus, TicketError> {
        let result = self
            .queue
            .enqueue(move |backend| async move {
                let Some(row) = backend.get(id).await? else {
                    return Ok(Err(TicketError::NotFound(TicketRef::Id(id))));
                };
                let stale = row.has_stale_status();
                let ticket = Ticket::from_row(row);
                let status = ticket.status();
                if stale {
                    let report = backend.upsert_many(&[ticket.to_row()]).await?;
                    if let Some(failed) = report.failed.first() {
                        return Err(StorageError::Database(failed.error.clone()));
                    }
                    STATUS_REPAIRS.inc();
                    tracing::warn!(ticket_id = id, status = %status, "Repaired stale ticket status");
                }
                Ok(Ok(status))
            })
            .await;
        self.observe("update_status", &result);
        result?
    }

    /// Read-modify-write of one ticket inside the write queue.
    async fn modify<F>(
        &self,
        key: TicketRef,
        operation: &'static str,
        mutate: F,
    ) -> Result<Ticket, TicketError>
    where
        F: FnOnce(&mut Ticket) -> Result<(), TransitionError> + Send + 'static,
    {
        let result = self
            .queue
            .enqueue(move |backend| async move {
                let row = match &key {
                    TicketRef::Id(id) => backend.get(*id).await?,
                    TicketRef::Channel(channel) => backend.get_by_channel(channel).await?,
                };
                let Some(row) = row else {
                    return Ok(Err(TicketError::NotFound(key)));
                };

                let mut ticket = Ticket::from_row(row);
                if let Err(e) = mutate(&mut ticket) {
                    return Ok(Err(TicketError::transition(&ticket, e)));
                }

                let report = backend.upsert_many(&[ticket.to_row()]).await?;
                if let Some(failed) = report.failed.first() {
                    return Err(StorageError::Database(failed.error.clone()));
                }
                Ok(Ok(ticket))
            })
            .await;
        self.observe(operation, &result);

        let outcome = result.map_err(TicketError::from).and_then(|inner| inner);
        let label = match &outcome {
            Ok(_) => "ok",
            Err(e) => e.metric_label(),
        };
        TICKET_TRANSITIONS
            .with_label_values(&[operation, label])
            .inc();
        outcome
    }

    /// Assign `user_id` to an unclaimed ticket.
    pub async fn claim_ticket(&self, id: i64, user_id: &str) -> Result<Ticket, TicketError> {
        if user_id.trim().is_empty() {
            return Err(TicketError::Validation("userId cannot be empty".to_string()));
        }
        let user_id = user_id.to_string();
        let ticket = self
            .modify(TicketRef::Id(id), "claim", move |t| t.claim(user_id))
            .await?;
        tracing::info!(ticket_id = id, claimed_by = ?ticket.claimed_by(), "Ticket claimed");
        Ok(ticket)
    }

    /// Close an unclaimed or claimed ticket with a reason.
    pub async fn close_ticket(
        &self,
        id: i64,
        user_id: &str,
        reason: &str,
    ) -> Result<Ticket, TicketError> {
        if user_id.trim().is_empty() {
            return Err(TicketError::Validation("userId cannot be empty".to_string()));
        }
        if reason.trim().is_empty() {
            return Err(TicketError::Validation(
                "closing reason cannot be empty".to_string(),
            ));
        }
        let user_id = user_id.to_string();
        let reason = reason.trim().to_string();
        let ticket = self
            .modify(TicketRef::Id(id), "close", move |t| t.close(user_id, reason))
            .await?;
        tracing::info!(ticket_id = id, closed_by = ?ticket.closed_by(), "Ticket closed");
        Ok(ticket)
    }

    /// Append a message to an open ticket.
    pub async fn append_message(
        &self,
        key: TicketRef,
        message: TicketMessage,
    ) -> Result<Ticket, TicketError> {
        self.modify(key, "append_message", move |t| t.push_message(message))
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Ticket, TicketError> {
        let result = self.backend.get(id).await;
        self.observe("get", &result);
        result?
            .map(Ticket::from_row)
            .ok_or(TicketError::NotFound(TicketRef::Id(id)))
    }

    pub async fn get_by_channel(&self, channel_id: &str) -> Result<Option<Ticket>, TicketError> {
        let result = self.backend.get_by_channel(channel_id).await;
        self.observe("get_by_channel", &result);
        Ok(result?.map(Ticket::from_row))
    }

    /// Every ticket in storage order. Unlike [`Self::load_tickets`], errors
    /// are returned and nothing is rewritten.
    pub async fn list(&self) -> Result<Vec<Ticket>, TicketError> {
        let result = self.backend.load_all().await;
        self.observe("load_all", &result);
        Ok(result?.into_iter().map(Ticket::from_row).collect())
    }

    /// Remove a ticket, returning what was removed.
    pub async fn delete(&self, id: i64) -> Result<Ticket, TicketError> {
        let result = self
            .queue
            .enqueue(move |backend| async move {
                let Some(row) = backend.get(id).await? else {
                    return Ok(Err(TicketError::NotFound(TicketRef::Id(id))));
                };
                backend.delete(id).await?;
                Ok(Ok(Ticket::from_row(row)))
            })
            .await;
        self.observe("delete", &result);

        let outcome = result.map_err(TicketError::from).and_then(|inner| inner);
        let label = match &outcome {
            Ok(_) => "ok",
            Err(e) => e.metric_label(),
        };
        TICKET_TRANSITIONS
            .with_label_values(&["delete", label])
            .inc();
        if outcome.is_ok() {
            tracing::info!(ticket_id = id, "Ticket deleted");
        }
        outcome
    }

    pub async fn count(&self) -> Result<u64, TicketError> {
        let result = self.backend.count().await;
        self.observe("count", &result);
        Ok(result?)
    }

    pub async fn ping(&self) -> Result<(), TicketError> {
        let result = self.backend.ping().await;
        self.observe("ping", &result);
        Ok(result?)
    }

    /// Run an ad-hoc statement through the write queue.
    pub async fn run_query(
        &self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<QueryResult, TicketError> {
        let sql = sql.to_string();
        let result = self
            .queue
            .enqueue(move |backend| async move { backend.run_query(&sql, &params).await })
            .await;
        self.observe("run_query", &result);
        Ok(result?)
    }
}
