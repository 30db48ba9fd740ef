//! Per-client source IP tracking.
//!
//! # Data Flow
//! ```text
//! core access log ──AccessLogTail──parse_line──▶ IpTracker::observe
//!                                                     │
//!                           scan (window, limits) ◀───┘
//!                                   │
//!                                   ▼
//!                     LimitExceeded ──mpsc──▶ policy enforcer
//! ```
//!
//! # Design Decisions
//! - Breaches are detected after the fact, never prevented
//! - State is dropped whenever the core process generation changes
//! - Log stamps are local wall-clock time with no zone, so a line's age is
//!   taken relative to the newest line of the same read

pub mod access_log;
pub mod tracker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::compiler::InboundSettings;
use crate::observability::metrics;
use crate::store::{run_blocking, SharedStore, StoreError};
use crate::supervisor::Supervisor;

pub use access_log::{parse_line, AccessEntry, AccessLogTail};
pub use tracker::{IpTracker, LimitExceeded};

#[derive(Debug, Error)]
pub enum IpScanError {
    #[error("reading access log failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("loading client limits failed: {0}")]
    Store(#[from] StoreError),
}

/// Result of one IP scan tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpScanReport {
    pub observed: usize,
    pub exceeded: usize,
}

struct TailState {
    tail: AccessLogTail,
    generation: Option<u64>,
}

/// Feeds the tracker from the access log and reports breaches.
pub struct IpMonitor {
    tracker: Arc<IpTracker>,
    supervisor: Arc<Supervisor>,
    store: SharedStore,
    events: mpsc::Sender<LimitExceeded>,
    state: Mutex<TailState>,
}

impl IpMonitor {
    pub fn new(
        tracker: Arc<IpTracker>,
        supervisor: Arc<Supervisor>,
        store: SharedStore,
        access_log: PathBuf,
        events: mpsc::Sender<LimitExceeded>,
    ) -> Self {
        Self {
            tracker,
            supervisor,
            store,
            events,
            state: Mutex::new(TailState {
                tail: AccessLogTail::new(access_log),
                generation: None,
            }),
        }
    }

    pub fn tracker(&self) -> &Arc<IpTracker> {
        &self.tracker
    }

    /// Read new log lines, scan the window and publish breaches.
    pub async fn tick(&self) -> Result<IpScanReport, IpScanError> {
        let mut state = self.state.lock().await;

        let generation = self.supervisor.identity().map(|id| id.generation);
        if generation != state.generation {
            tracing::debug!(?generation, "Core generation changed, IP state reset");
            self.tracker.reset();
            state.tail.rewind();
            state.generation = generation;
        }

        let now = Instant::now();
        let entries: Vec<AccessEntry> = state
            .tail
            .read_new_lines()
            .await?
            .iter()
            .filter_map(|line| parse_line(line))
            .collect();
        drop(state);

        let newest = entries.iter().filter_map(|e| e.logged_at).max();
        let mut observed = 0;
        for entry in &entries {
            let Some(at) = observed_at(now, newest, entry.logged_at, self.tracker.window()) else {
                continue;
            };
            self.tracker.observe(&entry.email, entry.ip, at);
            observed += 1;
        }

        let limits = self.load_limits().await?;
        let exceeded = self.tracker.scan(now, &limits);
        for event in &exceeded {
            metrics::record_ip_limit_exceeded();
            tracing::warn!(
                email = %event.email,
                distinct_ips = event.distinct_ips,
                limit = event.limit,
                "Client exceeded its IP limit"
            );
            if self.events.try_send(event.clone()).is_err() {
                tracing::warn!(email = %event.email, "Policy queue unavailable, IP limit event dropped");
            }
        }

        Ok(IpScanReport {
            observed,
            exceeded: exceeded.len(),
        })
    }

    async fn load_limits(&self) -> Result<HashMap<String, u32>, IpScanError> {
        let inbounds = run_blocking(&self.store, |s| s.list_inbounds()).await?;
        let mut limits = HashMap::new();
        for record in inbounds.iter().filter(|r| r.enable) {
            let Ok(settings) = InboundSettings::parse(record) else {
                continue;
            };
            for client in settings.enabled_clients() {
                limits.insert(client.email.clone(), client.limit_ip);
            }
        }
        Ok(limits)
    }
}

/// When a logged connection happened, on the monotonic clock.
///
/// Lines are aged against the newest stamp in the batch. Lines older than
/// the window are dropped; unstamped lines count as `now`.
fn observed_at(now: Instant, newest: Option<u64>, logged_at: Option<u64>, window: Duration) -> Option<Instant> {
    let (Some(newest), Some(logged_at)) = (newest, logged_at) else {
        return Some(now);
    };
    let age = Duration::from_secs(newest.saturating_sub(logged_at));
    if age > window {
        return None;
    }
    now.checked_sub(age)
}
