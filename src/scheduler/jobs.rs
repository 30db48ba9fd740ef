//! The engine's periodic activities.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::ip_tracker::IpMonitor;
use crate::policy::PolicyEnforcer;
use crate::reconciler::{ReconcileHandle, Reconciler};
use crate::scheduler::job::{PeriodicTask, TickError};
use crate::stats::{StatsCollector, TrafficLedger};
use crate::store::SharedStore;
use crate::supervisor::Supervisor;

/// Liveness probe plus crash restarts.
pub struct HealthJob {
    supervisor: Arc<Supervisor>,
}

impl HealthJob {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl PeriodicTask for HealthJob {
    fn name(&self) -> &'static str {
        "health"
    }

    async fn tick(&self) -> Result<(), TickError> {
        if self.supervisor.health_check().await {
            return Ok(());
        }
        match self.supervisor.apply_restart_policy().await {
            Some(Err(e)) => Err(e.into()),
            _ => Ok(()),
        }
    }
}

pub struct StatsJob {
    collector: Arc<StatsCollector>,
}

impl StatsJob {
    pub fn new(collector: Arc<StatsCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl PeriodicTask for StatsJob {
    fn name(&self) -> &'static str {
        "stats"
    }

    async fn tick(&self) -> Result<(), TickError> {
        self.collector.collect().await?;
        Ok(())
    }
}

pub struct FlushJob {
    ledger: Arc<TrafficLedger>,
    store: SharedStore,
}

impl FlushJob {
    pub fn new(ledger: Arc<TrafficLedger>, store: SharedStore) -> Self {
        Self { ledger, store }
    }
}

#[async_trait]
impl PeriodicTask for FlushJob {
    fn name(&self) -> &'static str {
        "ledger_flush"
    }

    async fn tick(&self) -> Result<(), TickError> {
        self.ledger.flush(&self.store).await?;
        Ok(())
    }
}

pub struct IpScanJob {
    monitor: Arc<IpMonitor>,
}

impl IpScanJob {
    pub fn new(monitor: Arc<IpMonitor>) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl PeriodicTask for IpScanJob {
    fn name(&self) -> &'static str {
        "ip_scan"
    }

    async fn tick(&self) -> Result<(), TickError> {
        self.monitor.tick().await?;
        Ok(())
    }
}

pub struct PolicyJob {
    enforcer: Arc<PolicyEnforcer>,
}

impl PolicyJob {
    pub fn new(enforcer: Arc<PolicyEnforcer>) -> Self {
        Self { enforcer }
    }
}

#[async_trait]
impl PeriodicTask for PolicyJob {
    fn name(&self) -> &'static str {
        "policy"
    }

    async fn tick(&self) -> Result<(), TickError> {
        let report = self.enforcer.tick().await?;
        if !report.disabled.is_empty() {
            tracing::info!(disabled = report.disabled.len(), outcome = ?report.reconcile, "Policy pass disabled clients");
        }
        Ok(())
    }
}

/// Safety-net reconcile on a timer, plus on-demand requests.
pub struct ReconcileJob {
    reconciler: Arc<Reconciler>,
    requests: ReconcileHandle,
}

impl ReconcileJob {
    pub fn new(reconciler: Arc<Reconciler>, requests: ReconcileHandle) -> Self {
        Self { reconciler, requests }
    }
}

#[async_trait]
impl PeriodicTask for ReconcileJob {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    async fn tick(&self) -> Result<(), TickError> {
        let trigger = self.requests.take_trigger();
        self.reconciler.reconcile(trigger).await?;
        Ok(())
    }

    fn wake(&self) -> Option<Arc<Notify>> {
        Some(self.requests.notifier())
    }
}
