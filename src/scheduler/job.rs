//! Periodic task contract and per-job status records.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;

use crate::supervisor::unix_ms;

/// Error type at the job boundary; jobs log and carry on.
pub type TickError = Box<dyn std::error::Error + Send + Sync>;

/// One periodic activity.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn tick(&self) -> Result<(), TickError>;

    /// Optional signal that runs the task ahead of its timer.
    fn wake(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// Status of one scheduled activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub name: &'static str,
    pub interval_ms: u64,
    pub last_run_ms: Option<u64>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub running: bool,
}

impl JobRecord {
    fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval_ms: interval.as_millis() as u64,
            last_run_ms: None,
            last_duration_ms: None,
            last_error: None,
            run_count: 0,
            running: false,
        }
    }
}

/// Shared table of job records.
#[derive(Default)]
pub struct JobRegistry {
    records: DashMap<&'static str, JobRecord>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, name: &'static str, interval: Duration) {
        self.records.insert(name, JobRecord::new(name, interval));
    }

    pub(crate) fn mark_running(&self, name: &'static str) {
        if let Some(mut record) = self.records.get_mut(name) {
            record.running = true;
        }
    }

    pub(crate) fn mark_finished(&self, name: &'static str, elapsed: Duration, error: Option<String>) {
        if let Some(mut record) = self.records.get_mut(name) {
            record.running = false;
            record.run_count += 1;
            record.last_run_ms = Some(unix_ms(SystemTime::now()));
            record.last_duration_ms = Some(elapsed.as_millis() as u64);
            record.last_error = error;
        }
    }

    pub fn get(&self, name: &str) -> Option<JobRecord> {
        self.records.get(name).map(|r| r.clone())
    }

    /// All records ordered by name.
    pub fn statuses(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.name);
        records
    }
}
