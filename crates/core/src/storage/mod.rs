//! Ticket persistence.
//!
//! One [`StorageBackend`] contract over three implementations (a JSON file,
//! an embedded SQLite database and a networked MySQL server), selected once at
//! startup by [`create_backend`]. Writes are funnelled through the
//! [`WriteQueue`] so that no backend ever sees interleaved mutations.

mod json;
mod mysql;
mod queue;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::{StorageBackendKind, StorageConfig};
use crate::ticket::TicketRow;

pub use json::JsonBackend;
pub use mysql::MySqlBackend;
pub use queue::WriteQueue;
pub use sqlite::SqliteBackend;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    /// The connection itself failed; the networked backend reconnects on this.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Write queue is closed")]
    QueueClosed,
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// A bound parameter for [`StorageBackend::run_query`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Outcome of an ad-hoc statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub rows_affected: u64,
}

/// A row written by [`StorageBackend::upsert_many`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedRow {
    pub channel_id: String,
    pub id: i64,
}

/// A row [`StorageBackend::upsert_many`] could not write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRow {
    pub channel_id: String,
    pub error: String,
}

/// Per-row outcome of a batch upsert. One failing row never aborts the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub saved: Vec<SavedRow>,
    pub failed: Vec<FailedRow>,
}

impl UpsertReport {
    /// Storage id assigned to the row with this channel, if it was saved.
    pub fn id_for(&self, channel_id: &str) -> Option<i64> {
        self.saved
            .iter()
            .find(|s| s.channel_id == channel_id)
            .map(|s| s.id)
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Uniform persistence contract over every backend.
///
/// Implementations assume they are driven one write at a time (through the
/// [`WriteQueue`]); reads may run concurrently with a write.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> StorageBackendKind;

    /// Idempotent schema bootstrap. Safe to run on every start.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Every row. Rows that cannot be decoded are skipped with a warning.
    async fn load_all(&self) -> Result<Vec<TicketRow>, StorageError>;

    async fn get(&self, id: i64) -> Result<Option<TicketRow>, StorageError>;

    async fn get_by_channel(&self, channel_id: &str) -> Result<Option<TicketRow>, StorageError>;

    /// Insert or update each row keyed by `channel_id`, overwriting every
    /// mutable field on conflict. Rows not in the batch are left untouched.
    async fn upsert_many(&self, rows: &[TicketRow]) -> Result<UpsertReport, StorageError>;

    /// Remove a row. Returns whether a row existed.
    async fn delete(&self, id: i64) -> Result<bool, StorageError>;

    async fn count(&self) -> Result<u64, StorageError>;

    /// Execute an ad-hoc statement. SQL backends only.
    async fn run_query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, StorageError>;

    /// Verify the backend is reachable.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// Build and initialize the backend selected by configuration.
pub async fn create_backend(
    config: &StorageConfig,
) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let backend: Arc<dyn StorageBackend> = match config.backend {
        StorageBackendKind::Json => Arc::new(JsonBackend::new(&config.json.path)),
        StorageBackendKind::EmbeddedSql => Arc::new(SqliteBackend::open(&config.sqlite.path)?),
        StorageBackendKind::NetworkedSql => {
            let mysql = config.mysql.as_ref().ok_or_else(|| {
                StorageError::Connection("storage.mysql is not configured".to_string())
            })?;
            Arc::new(MySqlBackend::connect(mysql.clone()).await?)
        }
    };

    backend.initialize().await?;
    tracing::info!(backend = backend.kind().as_str(), "Storage backend initialized");
    Ok(backend)
}

/// Column list shared by the SQL backends, in `TicketRow` order.
pub(crate) const TICKET_COLUMNS: &str = "id, type, userId, userTag, ticketNumber, status, \
     channelId, createdAt, claimedBy, closedBy, closingReason, users, messages";

/// Column values of one SQL `tickets` row, before the JSON columns and the
/// timestamp are decoded.
pub(crate) struct RawTicketRow {
    pub id: i64,
    pub ticket_type: String,
    pub user_id: String,
    pub user_tag: Option<String>,
    pub ticket_number: Option<i64>,
    pub status: Option<i64>,
    pub channel_id: String,
    pub created_at: String,
    pub claimed_by: Option<String>,
    pub closed_by: Option<String>,
    pub closing_reason: Option<String>,
    pub users: Option<String>,
    pub messages: Option<String>,
}

impl RawTicketRow {
    pub fn decode(self) -> Result<TicketRow, String> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("bad createdAt {:?}: {}", self.created_at, e))?;
        let messages = match self.messages.as_deref() {
            None | Some("") => Vec::new(),
            Some(json) => {
                serde_json::from_str(json).map_err(|e| format!("bad messages: {}", e))?
            }
        };
        // Derived column; a broken value is recomputed on the next save.
        let users = self
            .users
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default();
        let ticket_number = u32::try_from(self.ticket_number.unwrap_or(0))
            .map_err(|_| format!("bad ticketNumber {:?}", self.ticket_number))?;

        Ok(TicketRow {
            id: Some(self.id),
            ticket_type: self.ticket_type,
            user_id: self.user_id,
            user_tag: self.user_tag.unwrap_or_default(),
            ticket_number,
            status: self.status,
            channel_id: self.channel_id,
            created_at,
            claimed_by: self.claimed_by,
            closed_by: self.closed_by,
            closing_reason: self.closing_reason,
            users,
            messages,
        })
    }

    /// Decode, logging and dropping rows that cannot be read.
    pub fn decode_or_skip(self) -> Option<TicketRow> {
        let id = self.id;
        match self.decode() {
            Ok(row) => Some(row),
            Err(e) => {
                tracing::warn!(ticket_id = id, error = %e, "Skipping unreadable ticket row");
                None
            }
        }
    }
}
