//! SQLite-backed record store.
//!
//! Uses `rusqlite` with bundled SQLite. Holds:
//! - Inbound rows with their settings JSON (client lists live there)
//! - Per-client persisted traffic totals
//!
//! Every write runs inside one transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;

use crate::store::types::{
    ClientTraffic, InboundRecord, StoreError, StoreResult, TrafficDelta, TrafficEntity,
};
use crate::store::ConfigStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS inbounds (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag TEXT NOT NULL UNIQUE,
        protocol TEXT NOT NULL,
        listen TEXT NOT NULL DEFAULT '',
        port INTEGER NOT NULL,
        enable INTEGER NOT NULL DEFAULT 1,
        settings TEXT NOT NULL DEFAULT '{}',
        stream_settings TEXT NOT NULL DEFAULT '{}',
        sniffing TEXT NOT NULL DEFAULT '{}',
        up INTEGER NOT NULL DEFAULT 0,
        down INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS client_traffics (
        email TEXT PRIMARY KEY,
        up INTEGER NOT NULL DEFAULT 0,
        down INTEGER NOT NULL DEFAULT 0
    );
";

/// Record store on a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        // WAL keeps readers (admin queries) off the flush writer's back.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Fresh private database, used by tests and dry runs.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Flip `enable` on every client entry carrying `email`. Returns whether
/// the settings were changed.
fn set_client_enable(settings: &mut Value, email: &str, enabled: bool) -> bool {
    let Some(clients) = settings.get_mut("clients").and_then(Value::as_array_mut) else {
        return false;
    };

    let mut touched = false;
    for client in clients.iter_mut() {
        if client.get("email").and_then(Value::as_str) == Some(email) {
            if let Some(obj) = client.as_object_mut() {
                obj.insert("enable".to_string(), Value::Bool(enabled));
                touched = true;
            }
        }
    }
    touched
}

fn apply_delta(tx: &Transaction<'_>, delta: &TrafficDelta) -> StoreResult<()> {
    match &delta.entity {
        TrafficEntity::Client(email) => {
            tx.execute(
                "INSERT INTO client_traffics (email, up, down) VALUES (?1, ?2, ?3)
                 ON CONFLICT(email) DO UPDATE SET up = up + excluded.up, down = down + excluded.down",
                params![email, to_db(delta.up), to_db(delta.down)],
            )?;
        }
        TrafficEntity::Inbound(tag) => {
            let updated = tx.execute(
                "UPDATE inbounds SET up = up + ?1, down = down + ?2 WHERE tag = ?3",
                params![to_db(delta.up), to_db(delta.down), tag],
            )?;
            if updated == 0 {
                tracing::debug!(tag = %tag, "Traffic for unknown inbound dropped");
            }
        }
    }
    Ok(())
}

impl ConfigStore for SqliteStore {
    fn list_inbounds(&self) -> StoreResult<Vec<InboundRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tag, protocol, listen, port, enable, settings, stream_settings, sniffing, up, down
             FROM inbounds ORDER BY id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(InboundRecord {
                id: row.get(0)?,
                tag: row.get(1)?,
                protocol: row.get(2)?,
                listen: row.get(3)?,
                port: row.get(4)?,
                enable: row.get(5)?,
                settings: row.get(6)?,
                stream_settings: row.get(7)?,
                sniffing: row.get(8)?,
                up: from_db(row.get(9)?),
                down: from_db(row.get(10)?),
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn list_client_traffic(&self) -> StoreResult<Vec<ClientTraffic>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT email, up, down FROM client_traffics ORDER BY email")?;

        let rows = stmt.query_map([], |row| {
            Ok(ClientTraffic {
                email: row.get(0)?,
                up: from_db(row.get(1)?),
                down: from_db(row.get(2)?),
            })
        })?;

        let mut traffic = Vec::new();
        for row in rows {
            traffic.push(row?);
        }
        Ok(traffic)
    }

    fn update_client_enabled(&self, email: &str, enabled: bool) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let rows: Vec<(i64, String, String)> = {
            let mut stmt = tx.prepare("SELECT id, tag, settings FROM inbounds")?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            let collected: Result<Vec<_>, _> = mapped.collect();
            collected?
        };

        let mut found = false;
        for (id, tag, settings) in rows {
            // Cheap pre-filter before parsing every inbound.
            if !settings.contains(email) {
                continue;
            }
            let mut value: Value = serde_json::from_str(&settings).map_err(|source| {
                StoreError::Settings {
                    tag: tag.clone(),
                    source,
                }
            })?;
            if set_client_enable(&mut value, email, enabled) {
                let rewritten = serde_json::to_string(&value)
                    .map_err(|source| StoreError::Settings { tag, source })?;
                tx.execute(
                    "UPDATE inbounds SET settings = ?1 WHERE id = ?2",
                    params![rewritten, id],
                )?;
                found = true;
            }
        }

        if !found {
            return Err(StoreError::ClientNotFound(email.to_string()));
        }

        tx.commit()?;
        Ok(())
    }

    fn increment_persisted_traffic(&self, deltas: &[TrafficDelta]) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for delta in deltas {
            apply_delta(&tx, delta)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn upsert_inbound(&self, record: &InboundRecord) -> StoreResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO inbounds (tag, protocol, listen, port, enable, settings, stream_settings, sniffing)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(tag) DO UPDATE SET
                protocol = excluded.protocol,
                listen = excluded.listen,
                port = excluded.port,
                enable = excluded.enable,
                settings = excluded.settings,
                stream_settings = excluded.stream_settings,
                sniffing = excluded.sniffing",
            params![
                record.tag,
                record.protocol,
                record.listen,
                record.port,
                record.enable,
                record.settings,
                record.stream_settings,
                record.sniffing,
            ],
        )?;

        let id = conn
            .query_row(
                "SELECT id FROM inbounds WHERE tag = ?1",
                params![record.tag],
                |row| row.get(0),
            )
            .optional()?;
        id.ok_or_else(|| StoreError::Database(rusqlite::Error::QueryReturnedNoRows))
    }
}
