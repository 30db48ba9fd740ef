//! Keeps the live core on the latest compiled configuration.
//!
//! # Data Flow
//! ```text
//! trigger ──▶ serial lock ──▶ store.list_inbounds ──▶ Compiler
//!                                                        │
//!                        hash == running hash? ──yes──▶ Unchanged
//!                                 │ no
//!                                 ▼
//!                   Supervisor::start / reload (or defer while crashed)
//! ```
//!
//! # Design Decisions
//! - Requests are numbered; a run covers every request issued before it
//!   started, so queued callers return `Coalesced` without a second reload
//! - The store is read when the run starts, so the latest records always win
//! - While the core is crashed only an administrator bypasses the restart
//!   policy

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use crate::compiler::{CompileError, Compiler, DesiredConfig};
use crate::observability::metrics;
use crate::store::{run_blocking, SharedStore, StoreError};
use crate::supervisor::{ProcessState, Supervisor, SupervisorError};

/// Why a reconcile was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Startup,
    Scheduled,
    Policy,
    Admin,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::Startup => "startup",
            Trigger::Scheduled => "scheduled",
            Trigger::Policy => "policy",
            Trigger::Admin => "admin",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The running configuration already matches.
    Unchanged,
    Started,
    Reloaded,
    /// Covered by a run that started after this request.
    Coalesced,
    /// The core is crashed; the restart policy will launch the new config.
    DeferredToRestartPolicy,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::Started => "started",
            ReconcileOutcome::Reloaded => "reloaded",
            ReconcileOutcome::Coalesced => "coalesced",
            ReconcileOutcome::DeferredToRestartPolicy => "deferred",
        }
    }

    fn settles_request(&self) -> bool {
        !matches!(self, ReconcileOutcome::DeferredToRestartPolicy)
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Fire-and-forget reconcile requests, consumed by the reconcile job.
#[derive(Clone, Default)]
pub struct ReconcileHandle {
    notify: Arc<Notify>,
    admin: Arc<AtomicBool>,
}

impl ReconcileHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a reconcile soon. Requests made before the job wakes merge.
    pub fn request(&self, trigger: Trigger) {
        if trigger == Trigger::Admin {
            self.admin.store(true, Ordering::Release);
        }
        self.notify.notify_one();
    }

    /// Wakes the job that serves these requests.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Trigger to run with: `Admin` if any pending request was an admin one.
    pub fn take_trigger(&self) -> Trigger {
        if self.admin.swap(false, Ordering::AcqRel) {
            Trigger::Admin
        } else {
            Trigger::Scheduled
        }
    }
}

pub struct Reconciler {
    store: SharedStore,
    compiler: Compiler,
    supervisor: Arc<Supervisor>,
    serial: Mutex<()>,
    requested: AtomicU64,
    completed: AtomicU64,
    latest: ArcSwapOption<DesiredConfig>,
}

impl Reconciler {
    pub fn new(store: SharedStore, compiler: Compiler, supervisor: Arc<Supervisor>) -> Self {
        Self {
            store,
            compiler,
            supervisor,
            serial: Mutex::new(()),
            requested: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            latest: ArcSwapOption::empty(),
        }
    }

    /// Most recently compiled configuration, applied or not.
    pub fn latest(&self) -> Option<Arc<DesiredConfig>> {
        self.latest.load_full()
    }

    /// Bring the core in line with the store.
    pub async fn reconcile(&self, trigger: Trigger) -> ReconcileResult<ReconcileOutcome> {
        let ticket = self.requested.fetch_add(1, Ordering::AcqRel) + 1;
        let _serial = self.serial.lock().await;

        if self.completed.load(Ordering::Acquire) >= ticket {
            tracing::debug!(%trigger, ticket, "Reconcile request coalesced");
            metrics::record_reconcile(ReconcileOutcome::Coalesced.as_str());
            return Ok(ReconcileOutcome::Coalesced);
        }
        let covered = self.requested.load(Ordering::Acquire);

        match self.run(trigger).await {
            Ok(outcome) => {
                if outcome.settles_request() {
                    self.completed.fetch_max(covered, Ordering::AcqRel);
                }
                metrics::record_reconcile(outcome.as_str());
                Ok(outcome)
            }
            Err(e) => {
                metrics::record_reconcile("error");
                tracing::error!(%trigger, error = %e, "Reconcile failed");
                Err(e)
            }
        }
    }

    async fn run(&self, trigger: Trigger) -> ReconcileResult<ReconcileOutcome> {
        let records = run_blocking(&self.store, |s| s.list_inbounds()).await?;
        let desired = Arc::new(self.compiler.compile(&records)?);
        self.latest.store(Some(desired.clone()));

        if trigger == Trigger::Admin {
            self.supervisor.clear_degraded();
        }

        let state = self.supervisor.state();
        if state == ProcessState::Running {
            let unchanged = self
                .supervisor
                .running_config()
                .map(|running| running.hash == desired.hash)
                .unwrap_or(false);
            if unchanged {
                tracing::debug!(%trigger, hash = %desired.hash.short(), "Configuration unchanged");
                return Ok(ReconcileOutcome::Unchanged);
            }

            tracing::info!(%trigger, hash = %desired.hash.short(), "Applying changed configuration");
            self.supervisor.reload(desired).await?;
            return Ok(ReconcileOutcome::Reloaded);
        }

        if state == ProcessState::Crashed && trigger != Trigger::Admin {
            tracing::info!(
                %trigger,
                hash = %desired.hash.short(),
                "Core crashed; configuration handed to the restart policy"
            );
            self.supervisor.defer_to_restart_policy(desired).await;
            return Ok(ReconcileOutcome::DeferredToRestartPolicy);
        }

        tracing::info!(%trigger, %state, hash = %desired.hash.short(), "Starting core");
        self.supervisor.start(desired).await?;
        Ok(ReconcileOutcome::Started)
    }
}
