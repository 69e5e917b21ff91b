//! Embedded SQLite backend.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::SecondsFormat;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use super::{
    FailedRow, QueryResult, RawTicketRow, SavedRow, SqlValue, StorageBackend, StorageError,
    UpsertReport, TICKET_COLUMNS,
};
use crate::config::StorageBackendKind;
use crate::ticket::TicketRow;

/// Schema version stored in `PRAGMA user_version`.
///
/// 1: `tickets` and `users` exist with every column.
/// 2: `tickets.channelId` carries a UNIQUE constraint.
const SCHEMA_VERSION: i64 = 2;

/// Columns added after the first release, with the declaration used by
/// `ALTER TABLE ... ADD COLUMN` on older databases.
const LEGACY_COLUMNS: &[(&str, &str)] = &[
    ("userTag", "TEXT NOT NULL DEFAULT ''"),
    ("ticketNumber", "INTEGER NOT NULL DEFAULT 0"),
    ("status", "INTEGER"),
    ("claimedBy", "TEXT"),
    ("closedBy", "TEXT"),
    ("closingReason", "TEXT"),
    ("users", "TEXT NOT NULL DEFAULT '[]'"),
    ("messages", "TEXT NOT NULL DEFAULT '[]'"),
];

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// SQLite-backed ticket storage over a single shared connection.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) the database file and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let mut conn = Connection::open(path)?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StorageError::Database(format!("blocking task failed: {}", e)))?
    }
}

fn tickets_table_sql(name: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {name} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            type TEXT NOT NULL,
            userId TEXT NOT NULL,
            userTag TEXT NOT NULL DEFAULT '',
            ticketNumber INTEGER NOT NULL DEFAULT 0,
            status INTEGER,
            channelId TEXT NOT NULL UNIQUE,
            createdAt TEXT NOT NULL,
            claimedBy TEXT,
            closedBy TEXT,
            closingReason TEXT,
            users TEXT NOT NULL DEFAULT '[]',
            messages TEXT NOT NULL DEFAULT '[]'
        );
        "#
    )
}

const USERS_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT,
        displayName TEXT,
        discriminator TEXT,
        role TEXT,
        token TEXT
    );
"#;

/// Version-gated migration. A database already at [`SCHEMA_VERSION`] is
/// left untouched.
fn migrate(conn: &mut Connection) -> Result<(), StorageError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;

    if version < 1 {
        tx.execute_batch(&tickets_table_sql("tickets"))?;
        tx.execute_batch(USERS_TABLE_SQL)?;
        add_missing_columns(&tx)?;
    }

    if version < 2 && !has_unique_channel_index(&tx)? {
        rebuild_tickets_table(&tx)?;
    }

    tx.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
    tx.commit()?;

    tracing::info!(from = version, to = SCHEMA_VERSION, "SQLite schema migrated");
    Ok(())
}

fn add_missing_columns(tx: &Transaction<'_>) -> Result<(), StorageError> {
    let existing: Vec<String> = {
        let mut stmt = tx.prepare("SELECT name FROM pragma_table_info('tickets')")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        names.collect::<Result<_, _>>()?
    };

    for (column, decl) in LEGACY_COLUMNS {
        if !existing.iter().any(|c| c == column) {
            tracing::warn!(column, "Adding missing tickets column");
            tx.execute_batch(&format!("ALTER TABLE tickets ADD COLUMN {} {}", column, decl))?;
        }
    }
    Ok(())
}

fn has_unique_channel_index(tx: &Transaction<'_>) -> Result<bool, StorageError> {
    let unique_indexes: Vec<String> = {
        let mut stmt =
            tx.prepare("SELECT name FROM pragma_index_list('tickets') WHERE \"unique\" = 1")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        names.collect::<Result<_, _>>()?
    };

    for index in unique_indexes {
        let mut stmt = tx.prepare("SELECT name FROM pragma_index_info(?1)")?;
        let columns: Vec<String> = stmt
            .query_map(params![index], |row| row.get::<_, String>(0))?
            .collect::<Result<_, _>>()?;
        if columns == ["channelId"] {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Recreate `tickets` with the UNIQUE constraint. When several rows share a
/// channel, the oldest (lowest id) wins.
fn rebuild_tickets_table(tx: &Transaction<'_>) -> Result<(), StorageError> {
    let before: i64 = tx.query_row("SELECT COUNT(*) FROM tickets", [], |row| row.get(0))?;

    tx.execute_batch("DROP TABLE IF EXISTS tickets_new")?;
    tx.execute_batch(&tickets_table_sql("tickets_new"))?;
    tx.execute_batch(&format!(
        "INSERT OR IGNORE INTO tickets_new ({}) \
         SELECT id, type, userId, COALESCE(userTag, ''), COALESCE(ticketNumber, 0), status, \
                channelId, createdAt, claimedBy, closedBy, closingReason, \
                COALESCE(users, '[]'), COALESCE(messages, '[]') \
         FROM tickets ORDER BY id",
        TICKET_COLUMNS
    ))?;
    tx.execute_batch("DROP TABLE tickets")?;
    tx.execute_batch("ALTER TABLE tickets_new RENAME TO tickets")?;

    let after: i64 = tx.query_row("SELECT COUNT(*) FROM tickets", [], |row| row.get(0))?;
    if after < before {
        tracing::warn!(
            dropped = before - after,
            "Dropped tickets with duplicate channelId while adding UNIQUE constraint"
        );
    }
    Ok(())
}

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawTicketRow> {
    Ok(RawTicketRow {
        id: row.get(0)?,
        ticket_type: row.get(1)?,
        user_id: row.get(2)?,
        user_tag: row.get(3)?,
        ticket_number: row.get(4)?,
        status: row.get(5)?,
        channel_id: row.get(6)?,
        created_at: row.get(7)?,
        claimed_by: row.get(8)?,
        closed_by: row.get(9)?,
        closing_reason: row.get(10)?,
        users: row.get(11)?,
        messages: row.get(12)?,
    })
}

fn select_one(
    conn: &Connection,
    filter: &str,
    value: Value,
) -> Result<Option<TicketRow>, StorageError> {
    let sql = format!("SELECT {} FROM tickets WHERE {} = ?1", TICKET_COLUMNS, filter);
    let raw = conn
        .query_row(&sql, params![value], read_raw)
        .optional()?;
    Ok(raw.and_then(RawTicketRow::decode_or_skip))
}

fn upsert_one(conn: &Connection, row: &TicketRow) -> Result<i64, StorageError> {
    let users = serde_json::to_string(&row.users)?;
    let messages = serde_json::to_string(&row.messages)?;

    conn.execute(
        "INSERT INTO tickets (id, type, userId, userTag, ticketNumber, status, channelId,
                              createdAt, claimedBy, closedBy, closingReason, users, messages)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(channelId) DO UPDATE SET
            type = excluded.type,
            userId = excluded.userId,
            userTag = excluded.userTag,
            ticketNumber = excluded.ticketNumber,
            status = excluded.status,
            claimedBy = excluded.claimedBy,
            closedBy = excluded.closedBy,
            closingReason = excluded.closingReason,
            users = excluded.users,
            messages = excluded.messages",
        params![
            row.id,
            row.ticket_type,
            row.user_id,
            row.user_tag,
            row.ticket_number,
            row.status,
            row.channel_id,
            row.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            row.claimed_by,
            row.closed_by,
            row.closing_reason,
            users,
            messages,
        ],
    )?;

    let id = conn.query_row(
        "SELECT id FROM tickets WHERE channelId = ?1",
        params![row.channel_id],
        |r| r.get(0),
    )?;
    Ok(id)
}

fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::EmbeddedSql
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.with_conn(migrate).await
    }

    async fn load_all(&self) -> Result<Vec<TicketRow>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM tickets ORDER BY createdAt ASC, id ASC",
                TICKET_COLUMNS
            ))?;
            let raws = stmt.query_map([], read_raw)?;

            let mut rows = Vec::new();
            for raw in raws {
                match raw {
                    Ok(raw) => rows.extend(raw.decode_or_skip()),
                    Err(e) => tracing::warn!(error = %e, "Skipping unreadable ticket row"),
                }
            }
            Ok(rows)
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<TicketRow>, StorageError> {
        self.with_conn(move |conn| select_one(conn, "id", Value::Integer(id)))
            .await
    }

    async fn get_by_channel(&self, channel_id: &str) -> Result<Option<TicketRow>, StorageError> {
        let channel_id = channel_id.to_string();
        self.with_conn(move |conn| select_one(conn, "channelId", Value::Text(channel_id)))
            .await
    }

    async fn upsert_many(&self, rows: &[TicketRow]) -> Result<UpsertReport, StorageError> {
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            let mut report = UpsertReport::default();
            for row in &rows {
                match upsert_one(conn, row) {
                    Ok(id) => report.saved.push(SavedRow {
                        channel_id: row.channel_id.clone(),
                        id,
                    }),
                    Err(e) => {
                        tracing::warn!(channel_id = %row.channel_id, error = %e, "Failed to save ticket");
                        report.failed.push(FailedRow {
                            channel_id: row.channel_id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
            Ok(report)
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<bool, StorageError> {
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM tickets WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }

    async fn count(&self) -> Result<u64, StorageError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM tickets", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    async fn run_query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, StorageError> {
        let sql = sql.to_string();
        let values: Vec<Value> = params.iter().map(to_sqlite).collect();
        self.with_conn(move |conn| {
            let rows_affected = conn.execute(&sql, rusqlite::params_from_iter(values))?;
            Ok(QueryResult {
                rows_affected: rows_affected as u64,
            })
        })
        .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}
