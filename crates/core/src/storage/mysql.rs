//! Networked MySQL backend over a single connection.
//!
//! Every operation pings the connection first. A dead connection, or a
//! connection-level failure during the operation, triggers one reconnect and
//! one retry before the error reaches the caller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::future::BoxFuture;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{ConnectOptions, Connection, Row};
use tokio::sync::Mutex;

use super::{
    FailedRow, QueryResult, RawTicketRow, SavedRow, SqlValue, StorageBackend, StorageError,
    UpsertReport, TICKET_COLUMNS,
};
use crate::config::{MySqlConfig, StorageBackendKind};
use crate::ticket::TicketRow;

const CREATE_TICKETS: &str = r#"
    CREATE TABLE IF NOT EXISTS tickets (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        type VARCHAR(64) NOT NULL,
        userId VARCHAR(64) NOT NULL,
        userTag VARCHAR(255) NOT NULL DEFAULT '',
        ticketNumber BIGINT NOT NULL DEFAULT 0,
        status INT NULL,
        channelId VARCHAR(64) NOT NULL UNIQUE,
        createdAt VARCHAR(40) NOT NULL,
        claimedBy VARCHAR(64) NULL,
        closedBy VARCHAR(64) NULL,
        closingReason TEXT NULL,
        users TEXT NULL,
        messages LONGTEXT NULL
    ) CHARACTER SET utf8mb4
"#;

const CREATE_USERS: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id VARCHAR(64) PRIMARY KEY,
        username VARCHAR(255) NULL,
        displayName VARCHAR(255) NULL,
        discriminator VARCHAR(16) NULL,
        role VARCHAR(32) NULL,
        token TEXT NULL
    ) CHARACTER SET utf8mb4
"#;

pub struct MySqlBackend {
    config: MySqlConfig,
    conn: Mutex<Option<MySqlConnection>>,
}

impl MySqlBackend {
    /// Open the initial connection.
    pub async fn connect(config: MySqlConfig) -> Result<Self, StorageError> {
        let conn = open(&config).await?;
        tracing::info!(host = %config.host, database = %config.database, "Connected to MySQL");
        Ok(Self {
            config,
            conn: Mutex::new(Some(conn)),
        })
    }

    async fn reconnect<'a>(
        &self,
        slot: &'a mut Option<MySqlConnection>,
    ) -> Result<&'a mut MySqlConnection, StorageError> {
        if let Some(old) = slot.take() {
            // Best effort; the connection is usually already gone.
            let _ = old.close().await;
        }
        let conn = open(&self.config).await?;
        tracing::warn!(host = %self.config.host, "Reconnected to MySQL");
        Ok(slot.insert(conn))
    }

    /// Run `op` with ping-before-use and a single reconnect-and-retry.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: for<'c> Fn(&'c mut MySqlConnection) -> BoxFuture<'c, Result<T, sqlx::Error>>
            + Send
            + Sync,
        T: Send,
    {
        let mut slot = self.conn.lock().await;

        let alive = match slot.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        };
        let conn = if alive {
            slot.as_mut()
                .ok_or_else(|| StorageError::Connection("not connected".to_string()))?
        } else {
            tracing::warn!("MySQL connection failed ping");
            self.reconnect(&mut *slot).await?
        };

        match op(conn).await {
            Ok(value) => Ok(value),
            Err(e) if is_connection_error(&e) => {
                tracing::warn!(error = %e, "MySQL operation lost its connection, retrying once");
                let conn = self.reconnect(&mut *slot).await?;
                op(conn).await.map_err(into_storage_error)
            }
            Err(e) => Err(into_storage_error(e)),
        }
    }
}

async fn open(config: &MySqlConfig) -> Result<MySqlConnection, StorageError> {
    let options = MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.database);

    tokio::time::timeout(
        Duration::from_secs(config.connect_timeout_secs),
        options.connect(),
    )
    .await
    .map_err(|_| {
        StorageError::Connection(format!(
            "timed out connecting to {}:{}",
            config.host, config.port
        ))
    })?
    .map_err(|e| StorageError::Connection(e.to_string()))
}

fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

fn into_storage_error(e: sqlx::Error) -> StorageError {
    if is_connection_error(&e) {
        StorageError::Connection(e.to_string())
    } else {
        StorageError::Database(e.to_string())
    }
}

fn read_raw(row: &MySqlRow) -> Result<RawTicketRow, sqlx::Error> {
    Ok(RawTicketRow {
        id: row.try_get("id")?,
        ticket_type: row.try_get("type")?,
        user_id: row.try_get("userId")?,
        user_tag: row.try_get("userTag")?,
        ticket_number: row.try_get("ticketNumber")?,
        status: row.try_get("status")?,
        channel_id: row.try_get("channelId")?,
        created_at: row.try_get("createdAt")?,
        claimed_by: row.try_get("claimedBy")?,
        closed_by: row.try_get("closedBy")?,
        closing_reason: row.try_get("closingReason")?,
        users: row.try_get("users")?,
        messages: row.try_get("messages")?,
    })
}

fn decode_rows(rows: &[MySqlRow]) -> Vec<TicketRow> {
    rows.iter()
        .filter_map(|row| match read_raw(row) {
            Ok(raw) => raw.decode_or_skip(),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable ticket row");
                None
            }
        })
        .collect()
}

/// Owned bind values for one upsert.
#[derive(Clone)]
struct UpsertParams {
    id: Option<i64>,
    ticket_type: String,
    user_id: String,
    user_tag: String,
    ticket_number: i64,
    status: Option<i64>,
    channel_id: String,
    created_at: String,
    claimed_by: Option<String>,
    closed_by: Option<String>,
    closing_reason: Option<String>,
    users: String,
    messages: String,
}

impl UpsertParams {
    fn from_row(row: &TicketRow) -> Result<Self, StorageError> {
        Ok(Self {
            id: row.id,
            ticket_type: row.ticket_type.clone(),
            user_id: row.user_id.clone(),
            user_tag: row.user_tag.clone(),
            ticket_number: i64::from(row.ticket_number),
            status: row.status,
            channel_id: row.channel_id.clone(),
            created_at: row.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            claimed_by: row.claimed_by.clone(),
            closed_by: row.closed_by.clone(),
            closing_reason: row.closing_reason.clone(),
            users: serde_json::to_string(&row.users)?,
            messages: serde_json::to_string(&row.messages)?,
        })
    }
}

/// Upsert one row and return its id. An explicit id that already belongs to
/// another channel is refused; `ON DUPLICATE KEY` would otherwise overwrite
/// that other ticket.
async fn upsert_one(
    conn: &mut MySqlConnection,
    p: UpsertParams,
) -> Result<Result<i64, String>, sqlx::Error> {
    if let Some(id) = p.id {
        let owner: Option<(String,)> = sqlx::query_as("SELECT channelId FROM tickets WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some((channel,)) = owner {
            if channel != p.channel_id {
                return Ok(Err(format!("id {} already belongs to another ticket", id)));
            }
        }
    }

    sqlx::query(
        r#"
        INSERT INTO tickets (id, type, userId, userTag, ticketNumber, status, channelId,
                             createdAt, claimedBy, closedBy, closingReason, users, messages)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
            type = VALUES(type),
            userId = VALUES(userId),
            userTag = VALUES(userTag),
            ticketNumber = VALUES(ticketNumber),
            status = VALUES(status),
            claimedBy = VALUES(claimedBy),
            closedBy = VALUES(closedBy),
            closingReason = VALUES(closingReason),
            users = VALUES(users),
            messages = VALUES(messages)
        "#,
    )
    .bind(p.id)
    .bind(&p.ticket_type)
    .bind(&p.user_id)
    .bind(&p.user_tag)
    .bind(p.ticket_number)
    .bind(p.status)
    .bind(&p.channel_id)
    .bind(&p.created_at)
    .bind(&p.claimed_by)
    .bind(&p.closed_by)
    .bind(&p.closing_reason)
    .bind(&p.users)
    .bind(&p.messages)
    .execute(&mut *conn)
    .await?;

    let (id,): (i64,) = sqlx::query_as("SELECT id FROM tickets WHERE channelId = ?")
        .bind(&p.channel_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(Ok(id))
}

#[async_trait]
impl StorageBackend for MySqlBackend {
    fn kind(&self) -> StorageBackendKind {
        StorageBackendKind::NetworkedSql
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            Box::pin(async move {
                sqlx::query(CREATE_TICKETS).execute(&mut *conn).await?;
                sqlx::query(CREATE_USERS).execute(&mut *conn).await?;
                Ok(())
            })
        })
        .await
    }

    async fn load_all(&self) -> Result<Vec<TicketRow>, StorageError> {
        let sql = format!(
            "SELECT {} FROM tickets ORDER BY createdAt ASC, id ASC",
            TICKET_COLUMNS
        );
        let rows = self
            .with_conn(|conn| {
                let sql = sql.clone();
                Box::pin(async move { sqlx::query(&sql).fetch_all(conn).await })
            })
            .await?;
        Ok(decode_rows(&rows))
    }

    async fn get(&self, id: i64) -> Result<Option<TicketRow>, StorageError> {
        let sql = format!("SELECT {} FROM tickets WHERE id = ?", TICKET_COLUMNS);
        let rows = self
            .with_conn(|conn| {
                let sql = sql.clone();
                Box::pin(async move { sqlx::query(&sql).bind(id).fetch_all(conn).await })
            })
            .await?;
        Ok(decode_rows(&rows).into_iter().next())
    }

    async fn get_by_channel(&self, channel_id: &str) -> Result<Option<TicketRow>, StorageError> {
        let sql = format!("SELECT {} FROM tickets WHERE channelId = ?", TICKET_COLUMNS);
        let channel_id = channel_id.to_string();
        let rows = self
            .with_conn(|conn| {
                let sql = sql.clone();
                let channel_id = channel_id.clone();
                Box::pin(async move { sqlx::query(&sql).bind(channel_id).fetch_all(conn).await })
            })
            .await?;
        Ok(decode_rows(&rows).into_iter().next())
    }

    async fn upsert_many(&self, rows: &[TicketRow]) -> Result<UpsertReport, StorageError> {
        let mut report = UpsertReport::default();

        for row in rows {
            let outcome = match UpsertParams::from_row(row) {
                Ok(params) => self
                    .with_conn(|conn| Box::pin(upsert_one(conn, params.clone())))
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|inner| inner),
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(id) => report.saved.push(SavedRow {
                    channel_id: row.channel_id.clone(),
                    id,
                }),
                Err(error) => {
                    tracing::warn!(channel_id = %row.channel_id, %error, "Failed to save ticket");
                    report.failed.push(FailedRow {
                        channel_id: row.channel_id.clone(),
                        error,
                    });
                }
            }
        }

        Ok(report)
    }

    async fn delete(&self, id: i64) -> Result<bool, StorageError> {
        let result = self
            .with_conn(|conn| {
                Box::pin(async move {
                    sqlx::query("DELETE FROM tickets WHERE id = ?")
                        .bind(id)
                        .execute(conn)
                        .await
                })
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let (count,): (i64,) = self
            .with_conn(|conn| {
                Box::pin(async move {
                    sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM tickets")
                        .fetch_one(conn)
                        .await
                })
            })
            .await?;
        Ok(count as u64)
    }

    async fn run_query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, StorageError> {
        let sql = sql.to_string();
        let params = params.to_vec();
        let result = self
            .with_conn(|conn| {
                let sql = sql.clone();
                let params = params.clone();
                Box::pin(async move {
                    let mut query = sqlx::query(&sql);
                    for param in params {
                        query = match param {
                            SqlValue::Null => query.bind(None::<String>),
                            SqlValue::Integer(i) => query.bind(i),
                            SqlValue::Text(s) => query.bind(s),
                        };
                    }
                    query.execute(conn).await
                })
            })
            .await?;
        Ok(QueryResult {
            rows_affected: result.rows_affected(),
        })
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.with_conn(|_| Box::pin(async { Ok(()) })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_are_retryable() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_connection_error(&io));
        assert!(matches!(
            into_storage_error(io),
            StorageError::Connection(_)
        ));

        let missing = sqlx::Error::RowNotFound;
        assert!(!is_connection_error(&missing));
        assert!(matches!(
            into_storage_error(missing),
            StorageError::Database(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_fails() {
        let config = MySqlConfig {
            host: "127.0.0.1".to_string(),
            // Reserved port, nothing listens here.
            port: 1,
            user: "desk".to_string(),
            password: String::new(),
            database: "tickets".to_string(),
            connect_timeout_secs: 2,
        };
        let result = MySqlBackend::connect(config).await;
        assert!(matches!(result, Err(StorageError::Connection(_))));
    }
}
