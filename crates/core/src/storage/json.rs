//! Flat JSON file backend.
//!
//! The file holds an array of ticket objects. Saves merge by `channelId`
//! and replace the file atomically; entries that fail to decode are kept
//! verbatim so a bad row is never lost by a rewrite.
//!
//! Ids are never reused. The next id to hand out is kept in a sidecar file
//! (`<file>.seq`) so deleting the newest ticket does not free its id, and
//! legacy entries written without an id get one on startup.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    FailedRow, QueryResult, SavedRow, SqlValue, StorageBackend, StorageError, UpsertReport,
};
use crate::config::StorageBackendKind;
use crate::ticket::TicketRow;

pub struct JsonBackend {
    path: PathBuf,
    seq_path: PathBuf,
    /// Next id to assign; guards every write.
    next_id: Mutex<i64>,
}

impl JsonBackend {
    pub fn new(path: &Path) -> Self {
        let mut seq: OsString = path.as_os_str().to_owned();
        seq.push(".seq");
        Self {
            path: path.to_path_buf(),
            seq_path: PathBuf::from(seq),
            next_id: Mutex::new(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_entries(&self) -> Result<Vec<Value>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(Vec::new()),
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                StorageError::Serialization(format!(
                    "{} is not a JSON array of tickets: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_entries(&self, entries: &[Value]) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Stored high-water mark, or 0 when the sidecar is missing or unreadable.
    async fn read_seq(&self) -> i64 {
        match tokio::fs::read_to_string(&self.seq_path).await {
            Ok(text) => text.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(path = %self.seq_path.display(), "Ignoring unreadable id counter");
                0
            }),
            Err(_) => 0,
        }
    }

    async fn write_seq(&self, next_id: i64) -> Result<(), StorageError> {
        tokio::fs::write(&self.seq_path, next_id.to_string()).await?;
        Ok(())
    }
}

fn entry_id(entry: &Value) -> Option<i64> {
    entry.get("id").and_then(Value::as_i64)
}

fn max_id(entries: &[Value]) -> i64 {
    entries.iter().filter_map(entry_id).max().unwrap_or(0)
}

fn entry_channel(entry: &Value) -> Option<&str> {
    entry.get("channelId").and_then(Value::as_str)
}

fn decode(entry: &Value) -> Option<TicketRow> {
    match serde_json::from_value::<TicketRow>(entry.clone()) {
        Ok(row) => Some(row),
        Err(e) => {
            tracing::warn!(
                ticket_id = ?entry_id(entry),
                error = %e,
                "Skipping unreadable ticket entry"
            );
            None
        }
    }
}

#[async_trait]
impl StorageBackend for JsonBackend {
    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::Json
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut next_id = self.next_id.lock().await;
        if !tokio::fs::try_exists(&self.path).await? {
            self.write_entries(&[]).await?;
        }

        // Fail startup on a corrupt file rather than overwrite it later.
        let mut entries = self.read_entries().await?;
        let mut next = self
            .read_seq()
            .await
            .max(max_id(&entries) + 1)
            .max(1);

        let mut assigned = 0;
        for entry in entries.iter_mut() {
            if entry_id(entry).is_some() {
                continue;
            }
            if let Some(object) = entry.as_object_mut() {
                object.insert("id".to_string(), Value::from(next));
                next += 1;
                assigned += 1;
            }
        }
        if assigned > 0 {
            tracing::info!(assigned, "Assigned ids to legacy ticket entries");
            self.write_entries(&entries).await?;
        }

        self.write_seq(next).await?;
        *next_id = next;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<TicketRow>, StorageError> {
        let entries = self.read_entries().await?;
        Ok(entries.iter().filter_map(decode).collect())
    }

    async fn get(&self, id: i64) -> Result<Option<TicketRow>, StorageError> {
        let entries = self.read_entries().await?;
        Ok(entries
            .iter()
            .find(|e| entry_id(e) == Some(id))
            .and_then(decode))
    }

    async fn get_by_channel(&self, channel_id: &str) -> Result<Option<TicketRow>, StorageError> {
        let entries = self.read_entries().await?;
        Ok(entries
            .iter()
            .find(|e| entry_channel(e) == Some(channel_id))
            .and_then(decode))
    }

    async fn upsert_many(&self, rows: &[TicketRow]) -> Result<UpsertReport, StorageError> {
        let mut high_water = self.next_id.lock().await;
        let mut entries = self.read_entries().await?;
        let mut next_id = (*high_water).max(max_id(&entries) + 1);
        let mut report = UpsertReport::default();

        for row in rows {
            let existing = entries
                .iter()
                .position(|e| entry_channel(e) == Some(row.channel_id.as_str()));

            let id = match (existing.and_then(|i| entry_id(&entries[i])), row.id) {
                (Some(stored), _) => stored,
                (None, Some(requested)) => requested,
                (None, None) => next_id,
            };

            let clash = entries
                .iter()
                .enumerate()
                .any(|(i, e)| Some(i) != existing && entry_id(e) == Some(id));
            if clash {
                let error = format!("id {} already belongs to another ticket", id);
                tracing::warn!(channel_id = %row.channel_id, %error, "Failed to save ticket");
                report.failed.push(FailedRow {
                    channel_id: row.channel_id.clone(),
                    error,
                });
                continue;
            }

            let mut stored = row.clone();
            stored.id = Some(id);
            if let Some(i) = existing {
                // createdAt is immutable once written.
                if let Some(created_at) = entries[i].get("createdAt").cloned() {
                    if let Ok(original) = serde_json::from_value(created_at) {
                        stored.created_at = original;
                    }
                }
            }

            match serde_json::to_value(&stored) {
                Ok(value) => {
                    match existing {
                        Some(i) => entries[i] = value,
                        None => entries.push(value),
                    }
                    next_id = next_id.max(id + 1);
                    report.saved.push(SavedRow {
                        channel_id: row.channel_id.clone(),
                        id,
                    });
                }
                Err(e) => {
                    tracing::warn!(channel_id = %row.channel_id, error = %e, "Failed to save ticket");
                    report.failed.push(FailedRow {
                        channel_id: row.channel_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.write_entries(&entries).await?;
        if next_id != *high_water {
            self.write_seq(next_id).await?;
            *high_water = next_id;
        }
        Ok(report)
    }

    async fn delete(&self, id: i64) -> Result<bool, StorageError> {
        let _guard = self.next_id.lock().await;
        let mut entries = self.read_entries().await?;
        let before = entries.len();
        entries.retain(|e| entry_id(e) != Some(id));

        if entries.len() == before {
            return Ok(false);
        }
        self.write_entries(&entries).await?;
        Ok(true)
    }

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.load_all().await?.len() as u64)
    }

    async fn run_query(
        &self,
        _sql: &str,
        _params: &[SqlValue],
    ) -> Result<QueryResult, StorageError> {
        Err(StorageError::Unsupported {
            backend: "json",
            operation: "run_query",
        })
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.read_entries().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::ticket::{NewTicket, Ticket, TicketMessage};

    fn ticket(channel: &str) -> Ticket {
        Ticket::open(NewTicket {
            ticket_type: "Pytanie".to_string(),
            user_id: "U2".to_string(),
            user_tag: "user#0002".to_string(),
            ticket_number: 1,
            channel_id: channel.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn backend() -> (tempfile::TempDir, JsonBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonBackend::new(&dir.path().join("data").join("tickets.json"));
        backend.initialize().await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_initialize_creates_empty_array() {
        let (_dir, backend) = backend().await;
        let text = std::fs::read_to_string(backend.path()).unwrap();
        assert_eq!(serde_json::from_str::<Vec<Value>>(&text).unwrap().len(), 0);
        assert_eq!(backend.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_initialize_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickets.json");
        std::fs::write(&path, "{not json").unwrap();

        let backend = JsonBackend::new(&path);
        assert!(matches!(
            backend.initialize().await,
            Err(StorageError::Serialization(_))
        ));
        // The file is left as it was.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[tokio::test]
    async fn test_upsert_assigns_sequential_ids() {
        let (_dir, backend) = backend().await;
        let report = backend
            .upsert_many(&[ticket("C1").to_row(), ticket("C2").to_row()])
            .await
            .unwrap();
        assert_eq!(report.id_for("C1"), Some(1));
        assert_eq!(report.id_for("C2"), Some(2));

        let row = backend.get(2).await.unwrap().unwrap();
        assert_eq!(row.channel_id, "C2");
    }

    #[tokio::test]
    async fn test_save_subset_keeps_other_tickets() {
        let (_dir, backend) = backend().await;
        backend
            .upsert_many(&[ticket("C1").to_row(), ticket("C2").to_row()])
            .await
            .unwrap();

        let mut t = ticket("C1");
        t.push_message(TicketMessage::new("U2", "user#0002", "hello", Utc::now()))
            .unwrap();
        backend.upsert_many(&[t.to_row()]).await.unwrap();

        let rows = backend.load_all().await.unwrap();
        assert_eq!(rows.len(), 2);
        let c1 = rows.iter().find(|r| r.channel_id == "C1").unwrap();
        assert_eq!(c1.id, Some(1));
        assert_eq!(c1.messages.len(), 1);
        assert_eq!(c1.users, vec!["U2"]);
    }

    #[tokio::test]
    async fn test_upsert_keeps_original_created_at() {
        let (_dir, backend) = backend().await;
        let t = ticket("C1");
        backend.upsert_many(&[t.to_row()]).await.unwrap();

        let mut later = t.to_row();
        later.created_at = t.created_at + Duration::hours(1);
        backend.upsert_many(&[later]).await.unwrap();

        let row = backend.get_by_channel("C1").await.unwrap().unwrap();
        assert_eq!(row.created_at, t.created_at);
    }

    #[tokio::test]
    async fn test_unreadable_entries_survive_rewrites() {
        let (_dir, backend) = backend().await;
        let bad = serde_json::json!({ "id": 7, "channelId": "C-bad", "type": "Pomoc" });
        std::fs::write(
            backend.path(),
            serde_json::to_string(&vec![bad]).unwrap(),
        )
        .unwrap();

        assert!(backend.load_all().await.unwrap().is_empty());

        let report = backend.upsert_many(&[ticket("C1").to_row()]).await.unwrap();
        assert_eq!(report.id_for("C1"), Some(8));

        let text = std::fs::read_to_string(backend.path()).unwrap();
        let entries: Vec<Value> = serde_json::from_str(&text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["channelId"], "C-bad");
    }

    #[tokio::test]
    async fn test_delete_removes_only_that_ticket() {
        let (_dir, backend) = backend().await;
        backend
            .upsert_many(&[ticket("C1").to_row(), ticket("C2").to_row()])
            .await
            .unwrap();

        assert!(backend.delete(1).await.unwrap());
        assert!(!backend.delete(1).await.unwrap());
        let rows = backend.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].channel_id, "C2");
    }

    #[tokio::test]
    async fn test_deleted_ids_are_not_reused() {
        let (_dir, backend) = backend().await;
        backend
            .upsert_many(&[ticket("C1").to_row(), ticket("C2").to_row()])
            .await
            .unwrap();
        assert!(backend.delete(2).await.unwrap());

        let report = backend.upsert_many(&[ticket("C3").to_row()]).await.unwrap();
        assert_eq!(report.id_for("C3"), Some(3));

        // The counter outlives the process.
        assert!(backend.delete(3).await.unwrap());
        let reopened = JsonBackend::new(backend.path());
        reopened.initialize().await.unwrap();
        let report = reopened.upsert_many(&[ticket("C4").to_row()]).await.unwrap();
        assert_eq!(report.id_for("C4"), Some(4));
    }

    #[tokio::test]
    async fn test_initialize_assigns_ids_to_legacy_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickets.json");
        let mut first = ticket("OLD1").to_row();
        first.id = None;
        let mut second = ticket("OLD2").to_row();
        second.id = None;
        std::fs::write(&path, serde_json::to_string(&vec![first, second]).unwrap()).unwrap();

        let backend = JsonBackend::new(&path);
        backend.initialize().await.unwrap();

        let rows = backend.load_all().await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
        assert!(backend.delete(1).await.unwrap());
        assert_eq!(backend.count().await.unwrap(), 1);

        let report = backend.upsert_many(&[ticket("C1").to_row()]).await.unwrap();
        assert_eq!(report.id_for("C1"), Some(3));
    }

    #[tokio::test]
    async fn test_run_query_is_unsupported() {
        let (_dir, backend) = backend().await;
        let result = backend.run_query("DELETE FROM tickets", &[]).await;
        assert!(matches!(result, Err(StorageError::Unsupported { .. })));
    }
}
