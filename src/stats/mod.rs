//! Traffic accounting subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor::query_traffic ──▶ StatsCollector ──baseline diff──▶ TrafficLedger
//!                                                                    │
//!                                             flush (one transaction)│
//!                                                                    ▼
//!                                                               ConfigStore
//! ```
//!
//! # Design Decisions
//! - Baselines belong to one process generation and are dropped on restart
//! - A tick's deltas are merged into the ledger as one batch
//! - The ledger lock is never held across store I/O

pub mod collector;
pub mod ledger;

pub use collector::{BaselineTable, CollectError, CollectOutcome, StatsCollector};
pub use ledger::{LedgerEntry, LedgerSnapshotEntry, TrafficLedger};
