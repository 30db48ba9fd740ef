//! Process supervision subsystem.
//!
//! # Data Flow
//! ```text
//! reconciler ──start/reload/stop──┐
//! health job ──health_check───────┼──▶ lifecycle lock ──▶ CoreControl
//!            └─apply_restart_policy┘          │
//!                                             ▼
//!                         state / current process / running config
//!                         (published lock-free for readers)
//! stats job ──query_traffic──▶ current process (no lifecycle lock)
//!           └─take_final_readings──▶ counters read just before each stop
//! ```
//!
//! # Design Decisions
//! - One in-flight lifecycle operation at a time (async mutex)
//! - Every control call has a deadline; a missed deadline means `Crashed`
//! - Crashes are retried with backoff until the failure budget runs out,
//!   then the supervisor stays `Crashed` and reports itself degraded
//! - A running process has its counters read once more before it is
//!   terminated, so traffic since the last poll survives reloads

pub mod control;
pub mod restart;
pub mod state;
pub mod xray;

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::compiler::{ConfigHash, DesiredConfig};
use crate::config::{RestartConfig, TimeoutConfig};
use crate::observability::metrics;

pub use control::{ControlError, CoreControl, CounterKind, CounterSample, ProcessHandle};
pub use restart::RestartPolicy;
pub use state::ProcessState;
pub use xray::XrayCore;

/// Pause between liveness probes while a launch is pending.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Extra time granted on top of the grace period before a stop counts as hung.
const TERMINATE_MARGIN: Duration = Duration::from_secs(2);

/// Errors raised by lifecycle operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The process could not be launched (binary, ports, spawn).
    #[error("launch failed: {0}")]
    Launch(String),

    /// The process never answered a probe.
    #[error("process not healthy within {0:?}")]
    HealthCheckTimeout(Duration),

    /// A control call exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Termination failed.
    #[error("terminate failed: {0}")]
    Terminate(String),

    /// Reading counters failed.
    #[error("traffic query failed: {0}")]
    Query(String),

    /// The operation needs a running process.
    #[error("core is not running (state {0})")]
    NotRunning(ProcessState),
}

/// Result type for lifecycle operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Read-only identity of the current process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessIdentity {
    /// Increments with every launch.
    pub generation: u64,
    pub instance_id: Uuid,
    pub pid: Option<u32>,
    pub started_at_ms: u64,
}

/// The configuration the live process was last started or reloaded with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningConfigHandle {
    pub hash: ConfigHash,
    pub generation: u64,
    pub applied_at_ms: u64,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started { generation: u64 },
    Reloaded { generation: u64 },
    Stopped { generation: u64 },
    Crashed { generation: u64 },
    RestartFailed { attempt: u32, error: String },
    RestartExhausted { failures: u32 },
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: ProcessState,
    pub process: Option<ProcessIdentity>,
    pub running_config: Option<RunningConfigHandle>,
    pub consecutive_failures: u32,
    pub degraded: bool,
}

/// Counters read from the live process, tagged with its identity.
#[derive(Debug, Clone)]
pub struct TrafficReading {
    pub identity: ProcessIdentity,
    pub kind: CounterKind,
    pub samples: Vec<CounterSample>,
}

struct ActiveProcess {
    handle: ProcessHandle,
    identity: ProcessIdentity,
}

/// State only touched with the lifecycle lock held.
#[derive(Default)]
struct Lifecycle {
    /// Latest config a start/reload was asked for; restarts reuse it.
    desired: Option<Arc<DesiredConfig>>,
    /// Config of the live process; the rollback target of a failed reload.
    applied: Option<Arc<DesiredConfig>>,
    next_retry: Option<Instant>,
}

pub(crate) fn unix_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Owns the managed process and its state machine.
pub struct Supervisor {
    control: Arc<dyn CoreControl>,
    timeouts: TimeoutConfig,
    policy: RestartPolicy,
    lifecycle: Mutex<Lifecycle>,
    state: AtomicU8,
    current: ArcSwapOption<ActiveProcess>,
    running: ArcSwapOption<RunningConfigHandle>,
    generation: AtomicU64,
    failures: AtomicU32,
    degraded: AtomicBool,
    events: broadcast::Sender<SupervisorEvent>,
    final_readings: std::sync::Mutex<Vec<TrafficReading>>,
}

impl Supervisor {
    pub fn new(control: Arc<dyn CoreControl>, timeouts: TimeoutConfig, restart: &RestartConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            control,
            timeouts,
            policy: RestartPolicy::new(restart),
            lifecycle: Mutex::new(Lifecycle::default()),
            state: AtomicU8::new(ProcessState::Stopped as u8),
            current: ArcSwapOption::empty(),
            running: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            events,
            final_readings: std::sync::Mutex::new(Vec::new()),
        }
    }

    // --- Readers ---

    pub fn state(&self) -> ProcessState {
        ProcessState::from(self.state.load(Ordering::Acquire))
    }

    pub fn identity(&self) -> Option<ProcessIdentity> {
        self.current.load_full().map(|p| p.identity.clone())
    }

    pub fn running_config(&self) -> Option<RunningConfigHandle> {
        self.running.load_full().map(|r| (*r).clone())
    }

    /// True once the restart budget is exhausted.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state(),
            process: self.identity(),
            running_config: self.running_config(),
            consecutive_failures: self.consecutive_failures(),
            degraded: self.is_degraded(),
        }
    }

    // --- Lifecycle operations ---

    /// Launch `config`. A running process is replaced.
    pub async fn start(&self, config: Arc<DesiredConfig>) -> SupervisorResult<()> {
        let mut lc = self.lifecycle.lock().await;
        lc.desired = Some(config.clone());
        if self.current.load().is_some() {
            self.terminate_locked().await?;
        }
        self.launch_locked(&mut lc, config).await
    }

    /// Apply `config` to the running process, in place when possible.
    ///
    /// On failure the previous configuration is restored if one was running.
    pub async fn reload(&self, config: Arc<DesiredConfig>) -> SupervisorResult<()> {
        let mut lc = self.lifecycle.lock().await;
        lc.desired = Some(config.clone());
        let previous = lc.applied.clone();

        let active = match self.current.load_full() {
            Some(active) if self.state() == ProcessState::Running => active,
            _ => return self.launch_locked(&mut lc, config).await,
        };

        match timeout(
            self.timeouts.launch(),
            self.control.reload_in_place(&active.handle, &config.document),
        )
        .await
        {
            Ok(Ok(true)) => {
                let generation = active.identity.generation;
                self.publish_running(&config, generation);
                lc.applied = Some(config.clone());
                tracing::info!(generation, hash = %config.hash.short(), "Configuration reloaded in place");
                let _ = self.events.send(SupervisorEvent::Reloaded { generation });
                return Ok(());
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "In-place reload failed, restarting"),
            Err(_) => tracing::warn!("In-place reload timed out, restarting"),
        }

        self.terminate_locked().await?;
        let result = self.launch_locked(&mut lc, config).await;

        if let Err(e) = &result {
            if let Some(previous) = previous {
                tracing::warn!(error = %e, hash = %previous.hash.short(), "Reload failed, restoring previous configuration");
                match self.launch_locked(&mut lc, previous.clone()).await {
                    Ok(()) => lc.desired = Some(previous),
                    Err(rollback) => {
                        tracing::error!(error = %rollback, "Rollback to previous configuration failed")
                    }
                }
            }
        }
        result
    }

    /// Stop the process. Does nothing when already stopped.
    pub async fn stop(&self) -> SupervisorResult<()> {
        let mut lc = self.lifecycle.lock().await;
        lc.next_retry = None;
        if self.current.load().is_none() {
            if self.state() != ProcessState::Stopped {
                self.set_state(ProcessState::Stopped);
            }
            return Ok(());
        }
        self.terminate_locked().await
    }

    /// Probe the process. A dead process in `Running` is marked `Crashed`.
    ///
    /// Returns whether the process is alive.
    pub async fn health_check(&self) -> bool {
        let Some(active) = self.current.load_full() else {
            return false;
        };
        if self.state() != ProcessState::Running {
            return false;
        }

        let alive = timeout(self.timeouts.probe(), self.control.probe(&active.handle))
            .await
            .unwrap_or(false);
        if alive {
            return true;
        }

        let mut lc = self.lifecycle.lock().await;
        // A lifecycle op may have replaced the process while we probed.
        let still_current = self
            .current
            .load_full()
            .map(|p| p.identity.generation == active.identity.generation)
            .unwrap_or(false);
        if !still_current || self.state() != ProcessState::Running {
            return false;
        }

        let generation = active.identity.generation;
        tracing::error!(generation, pid = ?active.handle.pid, "Core process exited unexpectedly");
        self.current.store(None);
        self.running.store(None);
        lc.applied = None;
        // Reap whatever is left of it.
        if let Err(e) = self.control.terminate(&active.handle, Duration::ZERO).await {
            tracing::debug!(error = %e, "Reaping crashed process failed");
        }
        self.enter_crashed(&mut lc);
        let _ = self.events.send(SupervisorEvent::Crashed { generation });
        false
    }

    /// Restart a crashed process once its backoff has elapsed.
    ///
    /// Returns `None` when no attempt was due.
    pub async fn apply_restart_policy(&self) -> Option<SupervisorResult<()>> {
        let mut lc = self.lifecycle.lock().await;
        if self.state() != ProcessState::Crashed || self.is_degraded() {
            return None;
        }
        if let Some(at) = lc.next_retry {
            if Instant::now() < at {
                return None;
            }
        }
        let config = lc.desired.clone()?;

        let attempt = self.consecutive_failures() + 1;
        tracing::info!(attempt, hash = %config.hash.short(), "Restarting crashed core");
        let result = self.launch_locked(&mut lc, config).await;

        match &result {
            Ok(()) => metrics::record_restart("ok"),
            Err(e) => {
                metrics::record_restart("error");
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                let _ = self.events.send(SupervisorEvent::RestartFailed {
                    attempt: failures,
                    error: e.to_string(),
                });
                if self.policy.is_exhausted(failures) {
                    self.degraded.store(true, Ordering::Release);
                    lc.next_retry = None;
                    tracing::error!(
                        failures,
                        "Restart budget exhausted; core left crashed until an administrator reconciles"
                    );
                    let _ = self.events.send(SupervisorEvent::RestartExhausted { failures });
                } else {
                    lc.next_retry = Some(Instant::now() + self.policy.delay(failures + 1));
                }
            }
        }
        Some(result)
    }

    /// Record `config` as the target of the next restart without starting it.
    pub async fn defer_to_restart_policy(&self, config: Arc<DesiredConfig>) {
        let mut lc = self.lifecycle.lock().await;
        lc.desired = Some(config);
    }

    /// Reset the failure budget after an administrator intervened.
    pub fn clear_degraded(&self) {
        self.failures.store(0, Ordering::Release);
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!("Degraded status cleared");
        }
    }

    /// Read counters from the live process without taking the lifecycle lock.
    pub async fn query_traffic(&self) -> SupervisorResult<TrafficReading> {
        let state = self.state();
        if state != ProcessState::Running {
            return Err(SupervisorError::NotRunning(state));
        }
        let Some(active) = self.current.load_full() else {
            return Err(SupervisorError::NotRunning(state));
        };

        let samples = match timeout(self.timeouts.query(), self.control.query_traffic(&active.handle)).await {
            Ok(Ok(samples)) => samples,
            Ok(Err(e)) => return Err(SupervisorError::Query(e.to_string())),
            Err(_) => {
                return Err(SupervisorError::Timeout {
                    operation: "traffic query",
                    after: self.timeouts.query(),
                })
            }
        };

        Ok(TrafficReading {
            identity: active.identity.clone(),
            kind: self.control.counter_kind(),
            samples,
        })
    }

    /// Counters read from processes right before they were terminated,
    /// oldest first. Each reading is handed out once.
    pub fn take_final_readings(&self) -> Vec<TrafficReading> {
        let mut readings = self.final_readings.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *readings)
    }

    // --- Internals (lifecycle lock held) ---

    fn set_state(&self, next: ProcessState) {
        let prev = ProcessState::from(self.state.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            tracing::info!(from = %prev, to = %next, "Core state changed");
            metrics::record_process_state(next);
        }
    }

    fn enter_crashed(&self, lc: &mut Lifecycle) {
        self.set_state(ProcessState::Crashed);
        if lc.next_retry.is_none() {
            lc.next_retry = Some(Instant::now() + self.policy.delay(self.consecutive_failures() + 1));
        }
    }

    fn publish_running(&self, config: &DesiredConfig, generation: u64) {
        self.running.store(Some(Arc::new(RunningConfigHandle {
            hash: config.hash.clone(),
            generation,
            applied_at_ms: unix_ms(SystemTime::now()),
        })));
    }

    fn preflight(&self, config: &DesiredConfig) -> SupervisorResult<()> {
        for endpoint in &config.endpoints {
            let addr = endpoint.bind_address();
            TcpListener::bind(&addr).map_err(|e| {
                SupervisorError::Launch(format!("port {} for {} unavailable: {}", addr, endpoint.tag, e))
            })?;
        }
        Ok(())
    }

    async fn launch_locked(&self, lc: &mut Lifecycle, config: Arc<DesiredConfig>) -> SupervisorResult<()> {
        self.set_state(ProcessState::Starting);

        if let Err(e) = self.preflight(&config) {
            tracing::error!(error = %e, "Pre-launch check failed");
            self.enter_crashed(lc);
            return Err(e);
        }

        let handle = match timeout(self.timeouts.launch(), self.control.launch(&config.document)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Core launch failed");
                self.enter_crashed(lc);
                return Err(SupervisorError::Launch(e.to_string()));
            }
            Err(_) => {
                self.enter_crashed(lc);
                return Err(SupervisorError::Timeout {
                    operation: "launch",
                    after: self.timeouts.launch(),
                });
            }
        };

        if !self.wait_until_alive(&handle).await {
            tracing::error!(pid = ?handle.pid, "Core did not become healthy, terminating attempt");
            if let Err(e) = self.control.terminate(&handle, self.timeouts.grace()).await {
                tracing::warn!(error = %e, "Terminating unhealthy core failed");
            }
            self.enter_crashed(lc);
            return Err(SupervisorError::HealthCheckTimeout(self.timeouts.health_check()));
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let identity = ProcessIdentity {
            generation,
            instance_id: handle.id,
            pid: handle.pid,
            started_at_ms: unix_ms(handle.started_at),
        };
        self.current.store(Some(Arc::new(ActiveProcess { handle, identity })));
        self.publish_running(&config, generation);
        lc.applied = Some(config.clone());
        self.failures.store(0, Ordering::Release);
        self.degraded.store(false, Ordering::Release);
        lc.next_retry = None;
        self.set_state(ProcessState::Running);

        tracing::info!(generation, hash = %config.hash.short(), "Core running");
        let _ = self.events.send(SupervisorEvent::Started { generation });
        Ok(())
    }

    async fn wait_until_alive(&self, handle: &ProcessHandle) -> bool {
        let deadline = Instant::now() + self.timeouts.health_check();
        loop {
            if timeout(self.timeouts.probe(), self.control.probe(handle))
                .await
                .unwrap_or(false)
            {
                return true;
            }
            if Instant::now() + PROBE_INTERVAL > deadline {
                return false;
            }
            sleep(PROBE_INTERVAL).await;
        }
    }

    async fn record_final_reading(&self) {
        match self.query_traffic().await {
            Ok(reading) => {
                tracing::debug!(generation = reading.identity.generation, "Final counters read before stop");
                self.final_readings
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(reading);
            }
            Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => tracing::warn!(error = %e, "Could not read counters before stop; traffic since the last poll is lost"),
        }
    }

    async fn terminate_locked(&self) -> SupervisorResult<()> {
        self.record_final_reading().await;
        let Some(active) = self.current.swap(None) else {
            self.set_state(ProcessState::Stopped);
            return Ok(());
        };
        self.running.store(None);
        self.set_state(ProcessState::Stopping);

        let grace = self.timeouts.grace();
        let generation = active.identity.generation;
        match timeout(grace + TERMINATE_MARGIN, self.control.terminate(&active.handle, grace)).await {
            Ok(Ok(())) => {
                self.set_state(ProcessState::Stopped);
                tracing::info!(generation, "Core stopped");
                let _ = self.events.send(SupervisorEvent::Stopped { generation });
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_state(ProcessState::Crashed);
                Err(SupervisorError::Terminate(e.to_string()))
            }
            Err(_) => {
                self.set_state(ProcessState::Crashed);
                Err(SupervisorError::Timeout {
                    operation: "terminate",
                    after: grace + TERMINATE_MARGIN,
                })
            }
        }
    }
}
