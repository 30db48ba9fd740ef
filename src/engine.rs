//! Wires the subsystems together and owns their lifetime.
//!
//! # Startup
//! open store → build supervisor, reconciler, ledger, collector, IP monitor,
//! policy enforcer → initial reconcile → spawn jobs → bind admin API
//!
//! # Shutdown
//! trigger broadcast → wait for job loops and admin server → final ledger
//! flush → stop the core

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::admin::{self, AdminState};
use crate::compiler::{CompileError, Compiler};
use crate::config::EngineConfig;
use crate::ip_tracker::{IpMonitor, IpTracker};
use crate::lifecycle::Shutdown;
use crate::policy::PolicyEnforcer;
use crate::reconciler::{ReconcileHandle, Reconciler, Trigger};
use crate::scheduler::{
    FlushJob, HealthJob, IpScanJob, JobRegistry, PolicyJob, ReconcileJob, Scheduler, StatsJob,
};
use crate::stats::{StatsCollector, TrafficLedger};
use crate::store::{SharedStore, SqliteStore, StoreError};
use crate::supervisor::{CoreControl, Supervisor, XrayCore};

/// Queue depth between the IP monitor and the policy enforcer.
const IP_EVENT_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("config template: {0}")]
    Compile(#[from] CompileError),

    #[error("admin listener: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

pub struct Engine {
    config: EngineConfig,
    store: SharedStore,
    supervisor: Arc<Supervisor>,
    reconciler: Arc<Reconciler>,
    requests: ReconcileHandle,
    ledger: Arc<TrafficLedger>,
    collector: Arc<StatsCollector>,
    ip_monitor: Option<Arc<IpMonitor>>,
    enforcer: Arc<PolicyEnforcer>,
    scheduler: Scheduler,
    shutdown: Shutdown,
    admin_task: Option<JoinHandle<()>>,
    started_at: Instant,
}

impl Engine {
    /// Engine on the configured SQLite database and core binary.
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        let store: SharedStore = Arc::new(SqliteStore::open(&config.store.database_path)?);
        let control: Arc<dyn CoreControl> = Arc::new(XrayCore::new(&config.core));
        Self::with_parts(config, store, control)
    }

    /// Engine on an explicit store and control surface.
    pub fn with_parts(
        config: EngineConfig,
        store: SharedStore,
        control: Arc<dyn CoreControl>,
    ) -> EngineResult<Self> {
        let compiler = Compiler::new(&config.core)?;
        let supervisor = Arc::new(Supervisor::new(control, config.timeouts.clone(), &config.restart));
        let reconciler = Arc::new(Reconciler::new(store.clone(), compiler, supervisor.clone()));
        let ledger = Arc::new(TrafficLedger::new());
        let collector = Arc::new(StatsCollector::new(supervisor.clone(), ledger.clone()));

        let (ip_tx, ip_rx) = mpsc::channel(IP_EVENT_QUEUE);
        let ip_monitor = config.ip_limit.enabled.then(|| {
            let tracker = Arc::new(IpTracker::new(
                config.ip_limit.window(),
                config.ip_limit.default_limit,
            ));
            Arc::new(IpMonitor::new(
                tracker,
                supervisor.clone(),
                store.clone(),
                config.core.access_log_path.clone(),
                ip_tx,
            ))
        });
        let enforcer = Arc::new(PolicyEnforcer::new(store.clone(), reconciler.clone(), ip_rx));

        Ok(Self {
            config,
            store,
            supervisor,
            reconciler,
            requests: ReconcileHandle::new(),
            ledger,
            collector,
            ip_monitor,
            enforcer,
            scheduler: Scheduler::new(),
            shutdown: Shutdown::new(),
            admin_task: None,
            started_at: Instant::now(),
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn ledger(&self) -> &Arc<TrafficLedger> {
        &self.ledger
    }

    pub fn jobs(&self) -> Arc<JobRegistry> {
        self.scheduler.registry()
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState {
            supervisor: self.supervisor.clone(),
            reconciler: self.reconciler.clone(),
            requests: self.requests.clone(),
            ledger: self.ledger.clone(),
            jobs: self.scheduler.registry(),
            api_key: Arc::from(self.config.admin.api_key.as_str()),
            started_at: self.started_at,
        }
    }

    /// Reconcile once, then start the periodic jobs and the admin API.
    ///
    /// A failed initial reconcile is logged; the reconcile job retries it.
    pub async fn start(&mut self) -> EngineResult<()> {
        match self.reconciler.reconcile(Trigger::Startup).await {
            Ok(outcome) => tracing::info!(outcome = outcome.as_str(), "Initial reconcile finished"),
            Err(e) => tracing::error!(error = %e, "Initial reconcile failed; will retry on schedule"),
        }

        let intervals = self.config.intervals.clone();
        self.scheduler.spawn(
            Arc::new(HealthJob::new(self.supervisor.clone())),
            intervals.health_check(),
            self.shutdown.subscribe(),
        );
        self.scheduler.spawn(
            Arc::new(StatsJob::new(self.collector.clone())),
            intervals.stats_poll(),
            self.shutdown.subscribe(),
        );
        self.scheduler.spawn(
            Arc::new(FlushJob::new(self.ledger.clone(), self.store.clone())),
            intervals.ledger_flush(),
            self.shutdown.subscribe(),
        );
        if let Some(monitor) = &self.ip_monitor {
            self.scheduler.spawn(
                Arc::new(IpScanJob::new(monitor.clone())),
                intervals.ip_scan(),
                self.shutdown.subscribe(),
            );
        } else {
            tracing::info!("IP limit tracking disabled");
        }
        self.scheduler.spawn(
            Arc::new(PolicyJob::new(self.enforcer.clone())),
            intervals.policy(),
            self.shutdown.subscribe(),
        );
        self.scheduler.spawn(
            Arc::new(ReconcileJob::new(self.reconciler.clone(), self.requests.clone())),
            intervals.reconcile(),
            self.shutdown.subscribe(),
        );

        if self.config.admin.enabled {
            let listener = TcpListener::bind(&self.config.admin.bind_address).await?;
            let state = self.admin_state();
            let shutdown = self.shutdown.subscribe();
            self.admin_task = Some(tokio::spawn(async move {
                if let Err(e) = admin::serve(listener, state, shutdown).await {
                    tracing::error!(error = %e, "Admin API failed");
                }
            }));
        }

        tracing::info!(jobs = self.scheduler.job_count(), "Engine started");
        Ok(())
    }

    /// Stop jobs and the core, then flush the ledger.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        self.scheduler.join().await;
        if let Some(task) = self.admin_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Admin API task ended abnormally");
            }
        }

        // Stopping reads the core's counters one last time; collect them
        // before the final flush.
        if let Err(e) = self.supervisor.stop().await {
            tracing::error!(error = %e, "Stopping core failed");
        }
        if let Err(e) = self.collector.collect().await {
            tracing::warn!(error = %e, "Final traffic collection failed");
        }
        match self.ledger.flush(&self.store).await {
            Ok(entities) => tracing::info!(entities, "Final ledger flush complete"),
            Err(e) => tracing::error!(
                error = %e,
                unflushed = self.ledger.len(),
                "Final ledger flush failed; unflushed traffic is lost"
            ),
        }
        tracing::info!("Engine stopped");
    }
}
