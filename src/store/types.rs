//! Store record types and error definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A persisted inbound row.
///
/// `settings` holds the protocol settings JSON, including the `clients`
/// list. It is kept as text here; `compiler` owns its structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRecord {
    pub id: i64,
    pub tag: String,
    pub protocol: String,
    pub listen: String,
    pub port: u16,
    pub enable: bool,
    pub settings: String,
    pub stream_settings: String,
    pub sniffing: String,
    /// Persisted inbound-level totals.
    pub up: u64,
    pub down: u64,
}

impl InboundRecord {
    /// Minimal record with empty stream/sniffing settings.
    pub fn new(tag: &str, protocol: &str, port: u16, settings: &str) -> Self {
        Self {
            id: 0,
            tag: tag.to_string(),
            protocol: protocol.to_string(),
            listen: String::new(),
            port,
            enable: true,
            settings: settings.to_string(),
            stream_settings: "{}".to_string(),
            sniffing: "{}".to_string(),
            up: 0,
            down: 0,
        }
    }
}

/// Persisted per-client usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTraffic {
    pub email: String,
    pub up: u64,
    pub down: u64,
}

impl ClientTraffic {
    pub fn total(&self) -> u64 {
        self.up.saturating_add(self.down)
    }
}

/// Something the core reports traffic for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum TrafficEntity {
    /// A client, identified by email.
    Client(String),
    /// An inbound, identified by tag.
    Inbound(String),
}

impl TrafficEntity {
    pub fn client(email: impl Into<String>) -> Self {
        TrafficEntity::Client(email.into())
    }

    pub fn inbound(tag: impl Into<String>) -> Self {
        TrafficEntity::Inbound(tag.into())
    }
}

impl fmt::Display for TrafficEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficEntity::Client(email) => write!(f, "client:{}", email),
            TrafficEntity::Inbound(tag) => write!(f, "inbound:{}", tag),
        }
    }
}

/// Upload/download bytes to add to an entity's persisted totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficDelta {
    pub entity: TrafficEntity,
    pub up: u64,
    pub down: u64,
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A settings column could not be read or rewritten.
    #[error("inbound {tag} has unreadable settings: {source}")]
    Settings {
        tag: String,
        #[source]
        source: serde_json::Error,
    },

    /// No inbound carries a client with this email.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// A lock guarding the connection was poisoned by a panic.
    #[error("store connection lock poisoned")]
    Poisoned,

    /// The blocking task running the store call failed.
    #[error("store task failed: {0}")]
    Task(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
