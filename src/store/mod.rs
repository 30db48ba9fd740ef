//! Persistent record store.
//!
//! # Data Flow
//! ```text
//! compiler ──list_inbounds──────────────┐
//! policy ────list_client_traffic ───────┤
//!        └── update_client_enabled ─────┼──▶ ConfigStore (SQLite)
//! ledger flush ─increment_persisted_traffic┘
//! ```
//!
//! # Design Decisions
//! - The store is synchronous; async callers go through `run_blocking`
//! - Every write is one transaction, so flush and disable are all-or-nothing

pub mod sqlite;
pub mod types;

use std::sync::Arc;

pub use sqlite::SqliteStore;
pub use types::{
    ClientTraffic, InboundRecord, StoreError, StoreResult, TrafficDelta, TrafficEntity,
};

/// Record store the engine reads desired state from and writes usage into.
pub trait ConfigStore: Send + Sync {
    /// All inbound rows, enabled or not.
    fn list_inbounds(&self) -> StoreResult<Vec<InboundRecord>>;

    /// Flushed per-client usage totals.
    fn list_client_traffic(&self) -> StoreResult<Vec<ClientTraffic>>;

    /// Set the `enable` flag of the client with this email.
    fn update_client_enabled(&self, email: &str, enabled: bool) -> StoreResult<()>;

    /// Add a batch of deltas to the persisted totals in one transaction.
    fn increment_persisted_traffic(&self, deltas: &[TrafficDelta]) -> StoreResult<()>;

    /// Insert or replace an inbound by tag, returning its id.
    fn upsert_inbound(&self, record: &InboundRecord) -> StoreResult<i64>;
}

/// Shared handle to the store.
pub type SharedStore = Arc<dyn ConfigStore>;

/// Run a store call on the blocking pool.
pub async fn run_blocking<T, F>(store: &SharedStore, f: F) -> StoreResult<T>
where
    F: FnOnce(&dyn ConfigStore) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}
