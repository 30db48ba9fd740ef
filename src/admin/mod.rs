//! Admin HTTP API.
//!
//! # Routes
//! - `POST /admin/reconcile` (`?wait=false` queues instead of waiting)
//! - `GET /admin/process`
//! - `GET /admin/ledger`
//! - `GET /admin/jobs`
//! - `GET /admin/status`
//!
//! Every route requires `Authorization: Bearer <api_key>`.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::reconciler::{ReconcileHandle, Reconciler};
use crate::scheduler::JobRegistry;
use crate::stats::TrafficLedger;
use crate::supervisor::Supervisor;

use self::auth::admin_auth_middleware;
use self::handlers::*;

/// Everything the admin handlers can see.
#[derive(Clone)]
pub struct AdminState {
    pub supervisor: Arc<Supervisor>,
    pub reconciler: Arc<Reconciler>,
    pub requests: ReconcileHandle,
    pub ledger: Arc<TrafficLedger>,
    pub jobs: Arc<JobRegistry>,
    pub api_key: Arc<str>,
    pub started_at: Instant,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/reconcile", post(trigger_reconcile))
        .route("/admin/process", get(get_process))
        .route("/admin/ledger", get(get_ledger))
        .route("/admin/jobs", get(get_jobs))
        .route("/admin/status", get(get_status))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API starting");

    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Admin API stopped");
    Ok(())
}
