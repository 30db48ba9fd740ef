use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::reconciler::{ReconcileError, Trigger};
use crate::scheduler::JobRecord;
use crate::stats::LedgerSnapshotEntry;
use crate::supervisor::{ProcessState, SupervisorStatus};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub state: ProcessState,
    pub degraded: bool,
    pub uptime_secs: u64,
    pub running_hash: Option<String>,
    pub ledger_entries: usize,
    pub jobs: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileParams {
    pub wait: Option<bool>,
}

fn reconcile_error_status(error: &ReconcileError) -> StatusCode {
    match error {
        ReconcileError::Compile(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ReconcileError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        ReconcileError::Supervisor(_) => StatusCode::BAD_GATEWAY,
    }
}

pub async fn trigger_reconcile(
    State(state): State<AdminState>,
    Query(params): Query<ReconcileParams>,
) -> Response {
    if !params.wait.unwrap_or(true) {
        state.requests.request(Trigger::Admin);
        return (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "queued" })),
        )
            .into_response();
    }

    match state.reconciler.reconcile(Trigger::Admin).await {
        Ok(outcome) => Json(serde_json::json!({
            "outcome": outcome,
            "running": state.supervisor.running_config(),
        }))
        .into_response(),
        Err(e) => (
            reconcile_error_status(&e),
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

pub async fn get_process(State(state): State<AdminState>) -> Json<SupervisorStatus> {
    Json(state.supervisor.status())
}

pub async fn get_ledger(State(state): State<AdminState>) -> Json<Vec<LedgerSnapshotEntry>> {
    Json(state.ledger.snapshot())
}

pub async fn get_jobs(State(state): State<AdminState>) -> Json<Vec<JobRecord>> {
    Json(state.jobs.statuses())
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        state: state.supervisor.state(),
        degraded: state.supervisor.is_degraded(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        running_hash: state.supervisor.running_config().map(|r| r.hash.0),
        ledger_entries: state.ledger.len(),
        jobs: state.jobs.statuses().len(),
    })
}
