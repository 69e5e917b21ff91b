//! A storage backend whose every operation fails.

use async_trait::async_trait;

use crate::config::StorageBackendKind;
use crate::storage::{QueryResult, SqlValue, StorageBackend, StorageError, UpsertReport};
use crate::ticket::TicketRow;

/// Simulates an unreachable database.
#[derive(Debug, Clone)]
pub struct FailingBackend {
    message: String,
}

impl Default for FailingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FailingBackend {
    pub fn new() -> Self {
        Self {
            message: "database unavailable".to_string(),
        }
    }

    fn fail<T>(&self) -> Result<T, StorageError> {
        Err(StorageError::Connection(self.message.clone()))
    }
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::NetworkedSql
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.fail()
    }

    async fn load_all(&self) -> Result<Vec<TicketRow>, StorageError> {
        self.fail()
    }

    async fn get(&self, _id: i64) -> Result<Option<TicketRow>, StorageError> {
        self.fail()
    }

    async fn get_by_channel(&self, _channel_id: &str) -> Result<Option<TicketRow>, StorageError> {
        self.fail()
    }

    async fn upsert_many(&self, _rows: &[TicketRow]) -> Result<UpsertReport, StorageError> {
        self.fail()
    }

    async fn delete(&self, _id: i64) -> Result<bool, StorageError> {
        self.fail()
    }

    async fn count(&self) -> Result<u64, StorageError> {
        self.fail()
    }

    async fn run_query(
        &self,
        _sql: &str,
        _params: &[SqlValue],
    ) -> Result<QueryResult, StorageError> {
        self.fail()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.fail()
    }
}
