//! Client policy enforcement.
//!
//! # Data Flow
//! ```text
//! LimitExceeded events ─┐
//! store: client traffic ┼──▶ PolicyEnforcer::tick ──update_client_enabled──▶ store
//! store: inbounds ──────┘              │
//!                                      └──(any disabled)──▶ Reconciler (one run)
//! ```
//!
//! # Design Decisions
//! - Quotas are checked against flushed totals only, never the ledger
//! - Clients are only ever disabled here; re-enabling is an admin action
//! - An IP-limit breach is kept until the disable is persisted

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::compiler::InboundSettings;
use crate::ip_tracker::LimitExceeded;
use crate::observability::metrics;
use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler, Trigger};
use crate::store::{run_blocking, SharedStore, StoreError};
use crate::supervisor::unix_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    IpLimit,
    QuotaExceeded,
    Expired,
}

impl DisableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisableReason::IpLimit => "ip_limit",
            DisableReason::QuotaExceeded => "quota_exceeded",
            DisableReason::Expired => "expired",
        }
    }
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisabledClient {
    pub email: String,
    pub reason: DisableReason,
}

/// What one policy tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PolicyReport {
    pub disabled: Vec<DisabledClient>,
    /// Inbounds whose settings could not be read.
    pub skipped_inbounds: usize,
    /// Disables the store rejected; retried next tick.
    pub failed: usize,
    pub reconcile: Option<ReconcileOutcome>,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("reconcile after disabling clients failed: {0}")]
    Reconcile(#[from] ReconcileError),
}

/// IP-limit breaches received but not yet applied.
struct IpLimitQueue {
    events: mpsc::Receiver<LimitExceeded>,
    pending: HashSet<String>,
}

impl IpLimitQueue {
    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.pending.insert(event.email);
        }
    }
}

pub struct PolicyEnforcer {
    store: SharedStore,
    reconciler: Arc<Reconciler>,
    ip_limits: Mutex<IpLimitQueue>,
}

impl PolicyEnforcer {
    pub fn new(
        store: SharedStore,
        reconciler: Arc<Reconciler>,
        ip_events: mpsc::Receiver<LimitExceeded>,
    ) -> Self {
        Self {
            store,
            reconciler,
            ip_limits: Mutex::new(IpLimitQueue {
                events: ip_events,
                pending: HashSet::new(),
            }),
        }
    }

    pub async fn tick(&self) -> Result<PolicyReport, PolicyError> {
        self.tick_at(unix_ms(SystemTime::now()) as i64).await
    }

    /// Run one enforcement pass as of `now_ms` (unix milliseconds).
    pub async fn tick_at(&self, now_ms: i64) -> Result<PolicyReport, PolicyError> {
        let mut ip_limits = self.ip_limits.lock().await;

        let (inbounds, traffic) = run_blocking(&self.store, |s| {
            Ok((s.list_inbounds()?, s.list_client_traffic()?))
        })
        .await?;
        ip_limits.drain();
        // Breaches of clients already disabled or removed are dropped here;
        // failed disables put theirs back below.
        let over_ip_limit = std::mem::take(&mut ip_limits.pending);
        let usage: HashMap<String, u64> = traffic.iter().map(|t| (t.email.clone(), t.total())).collect();

        let mut report = PolicyReport::default();
        let mut seen = HashSet::new();
        let mut verdicts = Vec::new();

        for record in &inbounds {
            let settings = match InboundSettings::parse(record) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(tag = %record.tag, error = %e, "Skipping inbound with unreadable settings");
                    report.skipped_inbounds += 1;
                    continue;
                }
            };

            for client in settings.enabled_clients() {
                if !seen.insert(client.email.clone()) {
                    continue;
                }
                let used = usage.get(&client.email).copied().unwrap_or(0);
                let reason = if over_ip_limit.contains(&client.email) {
                    Some(DisableReason::IpLimit)
                } else if client.is_depleted(used) {
                    Some(DisableReason::QuotaExceeded)
                } else if client.is_expired(now_ms) {
                    Some(DisableReason::Expired)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    verdicts.push(DisabledClient {
                        email: client.email.clone(),
                        reason,
                    });
                }
            }
        }

        for verdict in verdicts {
            let email = verdict.email.clone();
            match run_blocking(&self.store, move |s| s.update_client_enabled(&email, false)).await {
                Ok(()) => {
                    metrics::record_client_disabled(verdict.reason.as_str());
                    tracing::info!(email = %verdict.email, reason = %verdict.reason, "Client disabled");
                    report.disabled.push(verdict);
                }
                Err(e) => {
                    tracing::warn!(email = %verdict.email, error = %e, "Could not disable client");
                    if verdict.reason == DisableReason::IpLimit {
                        ip_limits.pending.insert(verdict.email);
                    }
                    report.failed += 1;
                }
            }
        }
        drop(ip_limits);

        if !report.disabled.is_empty() {
            report.reconcile = Some(self.reconciler.reconcile(Trigger::Policy).await?);
        }
        Ok(report)
    }
}
