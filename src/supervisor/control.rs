//! Control surface of the managed proxy core.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::store::TrafficEntity;

/// Opaque reference to one launched process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub id: Uuid,
    pub pid: Option<u32>,
    pub started_at: SystemTime,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pid,
            started_at: SystemTime::now(),
        }
    }
}

/// How the core reports counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Monotonic totals since the process started.
    Cumulative,
    /// Totals since the previous read (read-and-reset).
    Incremental,
}

/// Counter values for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSample {
    pub entity: TrafficEntity,
    pub uplink: u64,
    pub downlink: u64,
}

impl CounterSample {
    pub fn new(entity: TrafficEntity, uplink: u64, downlink: u64) -> Self {
        Self {
            entity,
            uplink,
            downlink,
        }
    }
}

/// Errors raised by a control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The executable is missing or cannot be executed.
    #[error("binary unavailable: {0}")]
    BinaryUnavailable(String),

    /// Spawning, signalling or waiting failed.
    #[error("process I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Stats query failed or returned garbage.
    #[error("stats query failed: {0}")]
    Query(String),

    /// The handle does not refer to a process this surface manages.
    #[error("unknown process {0}")]
    UnknownProcess(Uuid),
}

/// Everything the supervisor needs from the core.
#[async_trait]
pub trait CoreControl: Send + Sync {
    /// Launch the core with `document` as its configuration.
    async fn launch(&self, document: &Value) -> Result<ProcessHandle, ControlError>;

    /// Ask the process to exit, killing it after `grace`.
    async fn terminate(&self, handle: &ProcessHandle, grace: Duration) -> Result<(), ControlError>;

    /// Whether the process is alive and answering on its control port.
    async fn probe(&self, handle: &ProcessHandle) -> bool;

    /// Read traffic counters for every entity the core tracks.
    async fn query_traffic(&self, handle: &ProcessHandle) -> Result<Vec<CounterSample>, ControlError>;

    fn counter_kind(&self) -> CounterKind {
        CounterKind::Cumulative
    }

    /// Apply `document` without restarting. `Ok(false)` means unsupported.
    async fn reload_in_place(
        &self,
        _handle: &ProcessHandle,
        _document: &Value,
    ) -> Result<bool, ControlError> {
        Ok(false)
    }
}
