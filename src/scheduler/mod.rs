//! Periodic activity scheduler.
//!
//! # Data Flow
//! ```text
//! interval timer ─┐
//! wake signal ────┼──▶ job loop ──▶ PeriodicTask::tick ──▶ JobRegistry
//! shutdown ───────┘ (exit)
//! ```
//!
//! # Design Decisions
//! - One task per job; a job never overlaps its own previous tick
//! - Overrunning ticks delay the next one rather than bursting
//! - Shutdown waits for in-flight ticks to finish

pub mod job;
pub mod jobs;

use std::future::pending;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::observability::metrics;

pub use job::{JobRecord, JobRegistry, PeriodicTask, TickError};
pub use jobs::{FlushJob, HealthJob, IpScanJob, PolicyJob, ReconcileJob, StatsJob};

pub struct Scheduler {
    registry: Arc<JobRegistry>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(JobRegistry::new()),
            handles: Vec::new(),
        }
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    /// Start `task` on its own timer until `shutdown` fires.
    pub fn spawn(
        &mut self,
        task: Arc<dyn PeriodicTask>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) {
        let name = task.name();
        self.registry.register(name, interval);
        tracing::info!(job = name, interval_ms = interval.as_millis() as u64, "Job scheduled");

        let registry = self.registry.clone();
        let handle = tokio::spawn(run_job(task, interval, registry, shutdown));
        self.handles.push((name, handle));
    }

    pub fn job_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every job loop to exit. Trigger shutdown first.
    pub async fn join(self) {
        let (names, handles): (Vec<_>, Vec<_>) = self.handles.into_iter().unzip();
        for (name, result) in names.into_iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                tracing::error!(job = name, error = %e, "Job task ended abnormally");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_wake(wake: Option<&Notify>) {
    match wake {
        Some(notify) => notify.notified().await,
        None => pending().await,
    }
}

async fn run_job(
    task: Arc<dyn PeriodicTask>,
    interval: Duration,
    registry: Arc<JobRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let name = task.name();
    let wake = task.wake();
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                tracing::debug!(job = name, "Job received shutdown signal, exiting loop");
                break;
            }
            _ = ticker.tick() => {}
            _ = wait_for_wake(wake.as_deref()) => {
                tracing::debug!(job = name, "Job woken ahead of schedule");
            }
        }

        run_once(task.as_ref(), &registry).await;
    }
}

/// Execute one tick and record its outcome.
pub async fn run_once(task: &dyn PeriodicTask, registry: &JobRegistry) {
    let name = task.name();
    registry.mark_running(name);
    let started = Instant::now();

    let result = task.tick().await;
    let elapsed = started.elapsed();
    metrics::record_job_run(name, result.is_ok(), elapsed);

    let error = match result {
        Ok(()) => None,
        Err(e) => {
            tracing::warn!(job = name, error = %e, "Job tick failed");
            Some(e.to_string())
        }
    };
    registry.mark_finished(name, elapsed, error);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::lifecycle::Shutdown;

    struct CountingTask {
        runs: AtomicUsize,
        in_flight: AtomicUsize,
        overlapped: AtomicUsize,
        fail: bool,
    }

    impl CountingTask {
        fn new(fail: bool) -> Self {
            Self {
                runs: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                overlapped: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl PeriodicTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn tick(&self) -> Result<(), TickError> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            time::sleep(Duration::from_millis(15)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("boom".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_job_runs_without_overlap_and_stops_on_shutdown() {
        let shutdown = Shutdown::new();
        let task = Arc::new(CountingTask::new(false));
        let mut scheduler = Scheduler::new();
        let registry = scheduler.registry();
        scheduler.spawn(task.clone(), Duration::from_millis(5), shutdown.subscribe());

        time::sleep(Duration::from_millis(120)).await;
        shutdown.trigger();
        scheduler.join().await;

        let runs = task.runs.load(Ordering::SeqCst);
        assert!(runs >= 2);
        assert_eq!(task.overlapped.load(Ordering::SeqCst), 0);
        assert_eq!(task.in_flight.load(Ordering::SeqCst), 0);

        let record = registry.get("counting").unwrap();
        assert_eq!(record.run_count as usize, runs);
        assert!(!record.running);
    }

    #[tokio::test]
    async fn test_failed_tick_is_recorded() {
        let registry = JobRegistry::new();
        registry.register("counting", Duration::from_secs(1));
        let task = CountingTask::new(true);

        run_once(&task, &registry).await;
        let record = registry.get("counting").unwrap();
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert_eq!(record.run_count, 1);
    }
}
