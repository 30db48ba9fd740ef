//! In-memory accumulator of traffic not yet written to the store.
//!
//! # Invariant
//! persisted totals + ledger deltas = true cumulative usage. A delta leaves
//! the ledger only when the store confirms the transaction holding it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::Serialize;

use crate::observability::metrics;
use crate::store::{run_blocking, SharedStore, StoreResult, TrafficDelta, TrafficEntity};
use crate::supervisor::unix_ms;

/// Unflushed bytes for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedgerEntry {
    pub up: u64,
    pub down: u64,
    pub updated_at_ms: u64,
}

impl LedgerEntry {
    fn add(&mut self, up: u64, down: u64, now_ms: u64) {
        self.up = self.up.saturating_add(up);
        self.down = self.down.saturating_add(down);
        self.updated_at_ms = self.updated_at_ms.max(now_ms);
    }
}

/// One row of [`TrafficLedger::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshotEntry {
    pub entity: TrafficEntity,
    pub up: u64,
    pub down: u64,
    pub updated_at_ms: u64,
}

#[derive(Default)]
pub struct TrafficLedger {
    entries: Mutex<HashMap<TrafficEntity, LedgerEntry>>,
}

impl TrafficLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TrafficEntity, LedgerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accumulate one delta.
    pub fn add_delta(&self, entity: TrafficEntity, up: u64, down: u64) {
        if up == 0 && down == 0 {
            return;
        }
        let now = unix_ms(SystemTime::now());
        self.entries().entry(entity).or_default().add(up, down, now);
    }

    /// Accumulate many deltas under one lock acquisition.
    pub fn merge_batch(&self, deltas: Vec<TrafficDelta>) {
        let now = unix_ms(SystemTime::now());
        let mut entries = self.entries();
        for delta in deltas {
            if delta.up == 0 && delta.down == 0 {
                continue;
            }
            entries.entry(delta.entity).or_default().add(delta.up, delta.down, now);
        }
        metrics::record_ledger_size(entries.len());
    }

    /// Current unflushed totals, ordered by entity.
    pub fn snapshot(&self) -> Vec<LedgerSnapshotEntry> {
        let mut rows: Vec<LedgerSnapshotEntry> = self
            .entries()
            .iter()
            .map(|(entity, entry)| LedgerSnapshotEntry {
                entity: entity.clone(),
                up: entry.up,
                down: entry.down,
                updated_at_ms: entry.updated_at_ms,
            })
            .collect();
        rows.sort_by(|a, b| a.entity.cmp(&b.entity));
        rows
    }

    pub fn get(&self, entity: &TrafficEntity) -> Option<LedgerEntry> {
        self.entries().get(entity).copied()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn take(&self) -> HashMap<TrafficEntity, LedgerEntry> {
        std::mem::take(&mut *self.entries())
    }

    /// Put a snapshot back, adding to whatever arrived in the meantime.
    fn restore(&self, taken: HashMap<TrafficEntity, LedgerEntry>) {
        let mut entries = self.entries();
        for (entity, entry) in taken {
            entries
                .entry(entity)
                .or_default()
                .add(entry.up, entry.down, entry.updated_at_ms);
        }
    }

    /// Commit all unflushed deltas in one store transaction.
    ///
    /// The lock is held only to swap the table out. On any store error the
    /// snapshot is merged back. An error reported after the commit actually
    /// landed cannot be told apart, so such a retry counts the batch twice.
    ///
    /// Returns the number of entities written.
    pub async fn flush(&self, store: &SharedStore) -> StoreResult<usize> {
        let taken = self.take();
        if taken.is_empty() {
            return Ok(0);
        }

        let mut deltas: Vec<TrafficDelta> = taken
            .iter()
            .map(|(entity, entry)| TrafficDelta {
                entity: entity.clone(),
                up: entry.up,
                down: entry.down,
            })
            .collect();
        deltas.sort_by(|a, b| a.entity.cmp(&b.entity));
        let count = deltas.len();

        match run_blocking(store, move |s| s.increment_persisted_traffic(&deltas)).await {
            Ok(()) => {
                metrics::record_flush("ok");
                tracing::debug!(entities = count, "Ledger flushed");
                Ok(count)
            }
            Err(e) => {
                metrics::record_flush("error");
                tracing::warn!(
                    error = %e,
                    entities = count,
                    "Ledger flush failed; deltas kept for the next flush (a commit that landed despite the error will be counted again)"
                );
                self.restore(taken);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::store::{ClientTraffic, ConfigStore, InboundRecord, SqliteStore, StoreError};

    struct FailingStore {
        fail: AtomicBool,
        inner: SqliteStore,
    }

    impl ConfigStore for FailingStore {
        fn list_inbounds(&self) -> StoreResult<Vec<InboundRecord>> {
            self.inner.list_inbounds()
        }
        fn list_client_traffic(&self) -> StoreResult<Vec<ClientTraffic>> {
            self.inner.list_client_traffic()
        }
        fn update_client_enabled(&self, email: &str, enabled: bool) -> StoreResult<()> {
            self.inner.update_client_enabled(email, enabled)
        }
        fn increment_persisted_traffic(&self, deltas: &[TrafficDelta]) -> StoreResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Task("disk full".into()));
            }
            self.inner.increment_persisted_traffic(deltas)
        }
        fn upsert_inbound(&self, record: &InboundRecord) -> StoreResult<i64> {
            self.inner.upsert_inbound(record)
        }
    }

    #[test]
    fn test_add_and_merge_accumulate() {
        let ledger = TrafficLedger::new();
        ledger.add_delta(TrafficEntity::client("alice"), 10, 20);
        ledger.merge_batch(vec![
            TrafficDelta {
                entity: TrafficEntity::client("alice"),
                up: 1,
                down: 2,
            },
            TrafficDelta {
                entity: TrafficEntity::inbound("inbound-443"),
                up: 0,
                down: 0,
            },
        ]);

        let entry = ledger.get(&TrafficEntity::client("alice")).unwrap();
        assert_eq!((entry.up, entry.down), (11, 22));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_flush_exactly_once() {
        let ledger = Arc::new(TrafficLedger::new());
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                ledger.add_delta(TrafficEntity::client("alice"), 3, 7);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let sqlite = SqliteStore::open_in_memory().unwrap();
        sqlite
            .upsert_inbound(&InboundRecord::new(
                "inbound-443",
                "vless",
                443,
                r#"{"clients":[{"id":"u1","email":"alice"}]}"#,
            ))
            .unwrap();
        let store: SharedStore = Arc::new(sqlite);

        assert_eq!(ledger.flush(&store).await.unwrap(), 1);
        assert!(ledger.is_empty());
        assert_eq!(ledger.flush(&store).await.unwrap(), 0);

        let traffic = store.list_client_traffic().unwrap();
        assert_eq!(traffic.len(), 1);
        assert_eq!((traffic[0].up, traffic[0].down), (150, 350));
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_deltas() {
        let failing = Arc::new(FailingStore {
            fail: AtomicBool::new(true),
            inner: SqliteStore::open_in_memory().unwrap(),
        });
        let store: SharedStore = failing.clone();
        let ledger = TrafficLedger::new();
        ledger.add_delta(TrafficEntity::client("bob"), 100, 200);

        assert!(ledger.flush(&store).await.is_err());
        ledger.add_delta(TrafficEntity::client("bob"), 1, 1);
        let entry = ledger.get(&TrafficEntity::client("bob")).unwrap();
        assert_eq!((entry.up, entry.down), (101, 201));

        failing.fail.store(false, Ordering::SeqCst);
        assert_eq!(ledger.flush(&store).await.unwrap(), 1);
        assert!(ledger.is_empty());
        let traffic = store.list_client_traffic().unwrap();
        assert_eq!((traffic[0].up, traffic[0].down), (101, 201));
    }
}
