use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub desk: DeskConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_port() -> u16 {
    8080
}

// ============================================================================
// Storage
// ============================================================================

/// Which persistence backend holds the tickets.
///
/// Read once at startup; the process never switches backends at runtime.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    /// A single JSON file holding an array of tickets.
    Json,
    /// An embedded SQLite database file.
    #[default]
    EmbeddedSql,
    /// A MySQL server reached over the network.
    NetworkedSql,
}

impl StorageBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackendKind::Json => "json",
            StorageBackendKind::EmbeddedSql => "embedded_sql",
            StorageBackendKind::NetworkedSql => "networked_sql",
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,
    #[serde(default)]
    pub json: JsonStorageConfig,
    #[serde(default)]
    pub sqlite: SqliteStorageConfig,
    /// Required when `backend = "networked_sql"`.
    #[serde(default)]
    pub mysql: Option<MySqlConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonStorageConfig {
    #[serde(default = "default_json_path")]
    pub path: PathBuf,
}

impl Default for JsonStorageConfig {
    fn default() -> Self {
        Self {
            path: default_json_path(),
        }
    }
}

fn default_json_path() -> PathBuf {
    PathBuf::from("tickets.json")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SqliteStorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("tickets.db")
}

/// MySQL connection parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MySqlConfig {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// Connect timeout in seconds (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_connect_timeout() -> u64 {
    10
}

// ============================================================================
// Ticket desk
// ============================================================================

/// Ticket desk (lifecycle) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeskConfig {
    /// Guild the ticket channels are created in.
    #[serde(default)]
    pub guild_id: String,
    /// Intake channels, one per ticket type.
    #[serde(default)]
    pub intake: Vec<IntakeChannel>,
    /// Retention cap; the oldest ticket is evicted when a new one would exceed it.
    #[serde(default = "default_max_tickets")]
    pub max_tickets: usize,
    /// Default timeout for bus request/response round trips.
    #[serde(default = "default_bus_timeout_ms")]
    pub bus_timeout_ms: u64,
    /// Channel that receives a line for every ticket closed from chat.
    #[serde(default)]
    pub close_log_channel: Option<String>,
    /// Delete the ticket channel when the ticket is closed from chat.
    #[serde(default = "default_true")]
    pub delete_channel_on_close: bool,
    /// Capacity of the write queue channel.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            guild_id: String::new(),
            intake: Vec::new(),
            max_tickets: default_max_tickets(),
            bus_timeout_ms: default_bus_timeout_ms(),
            close_log_channel: None,
            delete_channel_on_close: true,
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_max_tickets() -> usize {
    100
}

fn default_bus_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    256
}

/// A channel whose messages open tickets of one type.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct IntakeChannel {
    pub channel_id: String,
    pub ticket_type: String,
}

// ============================================================================
// Chat relay
// ============================================================================

/// Chat relay configuration (the process owning the chat-platform connection)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatConfig {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Bearer token sent to the relay.
    #[serde(default)]
    pub token: Option<String>,
    /// Request timeout in seconds (default: 10)
    #[serde(default = "default_chat_timeout")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            token: None,
            timeout_secs: default_chat_timeout(),
        }
    }
}

fn default_relay_url() -> String {
    "http://127.0.0.1:3001".to_string()
}

fn default_chat_timeout() -> u64 {
    10
}

// ============================================================================
// Sanitized views
// ============================================================================

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub storage: SanitizedStorageConfig,
    pub desk: DeskConfig,
    pub chat: SanitizedChatConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedStorageConfig {
    pub backend: String,
    pub json_path: PathBuf,
    pub sqlite_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql: Option<SanitizedMySqlConfig>,
}

/// MySQL config with the password hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedMySqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    pub password_configured: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedChatConfig {
    pub relay_url: String,
    pub token_configured: bool,
    pub timeout_secs: u64,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            storage: SanitizedStorageConfig {
                backend: config.storage.backend.as_str().to_string(),
                json_path: config.storage.json.path.clone(),
                sqlite_path: config.storage.sqlite.path.clone(),
                mysql: config.storage.mysql.as_ref().map(|m| SanitizedMySqlConfig {
                    host: m.host.clone(),
                    port: m.port,
                    user: m.user.clone(),
                    database: m.database.clone(),
                    password_configured: !m.password.is_empty(),
                }),
            },
            desk: config.desk.clone(),
            chat: SanitizedChatConfig {
                relay_url: config.chat.relay_url.clone(),
                token_configured: config.chat.token.is_some(),
                timeout_secs: config.chat.timeout_secs,
            },
        }
    }
}
