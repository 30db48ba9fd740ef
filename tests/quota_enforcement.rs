mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;

use corewarden::compiler::{Compiler, InboundSettings};
use corewarden::ip_tracker::LimitExceeded;
use corewarden::policy::{DisableReason, DisabledClient, PolicyEnforcer};
use corewarden::reconciler::{ReconcileOutcome, Reconciler, Trigger};
use corewarden::stats::TrafficLedger;
use corewarden::store::{ConfigStore, SharedStore, TrafficDelta, TrafficEntity};

use common::*;

struct Fixture {
    core: Arc<FakeCore>,
    store: SharedStore,
    ledger: TrafficLedger,
    enforcer: PolicyEnforcer,
    ip_events: mpsc::Sender<LimitExceeded>,
}

async fn fixture(clients: Vec<serde_json::Value>) -> Fixture {
    let store = store_with(&[inbound("vless-443", clients)]);
    let core = FakeCore::new();
    let sup = supervisor(&core, 3);
    let compiler = Compiler::new(&core_config()).unwrap();
    let reconciler = Arc::new(Reconciler::new(store.clone(), compiler, sup));
    reconciler.reconcile(Trigger::Startup).await.unwrap();

    let (tx, rx) = mpsc::channel(16);
    let enforcer = PolicyEnforcer::new(store.clone(), reconciler, rx);
    Fixture {
        core,
        store,
        ledger: TrafficLedger::new(),
        enforcer,
        ip_events: tx,
    }
}

fn stored_enable(store: &SharedStore, email: &str) -> Option<bool> {
    store.list_inbounds().unwrap().iter().find_map(|record| {
        InboundSettings::parse(record)
            .unwrap()
            .clients
            .into_iter()
            .find(|c| c.email == email)
            .map(|c| c.enable)
    })
}

#[tokio::test]
async fn test_quota_reached_after_flush_disables_client() {
    let fx = fixture(vec![client("alice", 1_000_000, 0), client("bob", 0, 0)]).await;
    fx.store
        .increment_persisted_traffic(&[TrafficDelta {
            entity: TrafficEntity::client("alice"),
            up: 999_000,
            down: 0,
        }])
        .unwrap();
    assert_eq!(fx.core.live_clients(), vec!["alice", "bob"]);

    // Unflushed usage does not count.
    fx.ledger.add_delta(TrafficEntity::client("alice"), 500, 500);
    let report = fx.enforcer.tick().await.unwrap();
    assert!(report.disabled.is_empty());
    assert_eq!(report.reconcile, None);

    fx.ledger.flush(&fx.store).await.unwrap();
    let report = fx.enforcer.tick().await.unwrap();
    assert_eq!(
        report.disabled,
        vec![DisabledClient {
            email: "alice".into(),
            reason: DisableReason::QuotaExceeded,
        }]
    );
    assert_eq!(report.reconcile, Some(ReconcileOutcome::Reloaded));
    assert_eq!(fx.core.live_clients(), vec!["bob"]);
    assert_eq!(fx.core.launch_count(), 2);
    assert_eq!(stored_enable(&fx.store, "alice"), Some(false));

    // Nothing left to do; no further reconcile.
    let report = fx.enforcer.tick().await.unwrap();
    assert!(report.disabled.is_empty());
    assert_eq!(report.reconcile, None);
    assert_eq!(fx.core.launch_count(), 2);
}

#[tokio::test]
async fn test_expired_and_ip_limited_clients_disabled_in_one_reconcile() {
    let now_ms = 1_700_000_000_000;
    let fx = fixture(vec![
        client("carol", 0, now_ms - 1),
        client("dave", 0, 0),
        client("erin", 0, now_ms + 60_000),
    ])
    .await;
    fx.ip_events
        .send(LimitExceeded {
            email: "dave".into(),
            distinct_ips: 4,
            limit: 3,
        })
        .await
        .unwrap();

    let report = fx.enforcer.tick_at(now_ms).await.unwrap();
    let mut disabled = report.disabled.clone();
    disabled.sort_by(|a, b| a.email.cmp(&b.email));
    assert_eq!(
        disabled,
        vec![
            DisabledClient {
                email: "carol".into(),
                reason: DisableReason::Expired,
            },
            DisabledClient {
                email: "dave".into(),
                reason: DisableReason::IpLimit,
            },
        ]
    );
    assert_eq!(report.reconcile, Some(ReconcileOutcome::Reloaded));
    assert_eq!(fx.core.launch_count(), 2);
    assert_eq!(fx.core.live_clients(), vec!["erin"]);
    assert_eq!(stored_enable(&fx.store, "erin"), Some(true));
}

#[tokio::test]
async fn test_malformed_inbound_is_skipped() {
    let fx = fixture(vec![client("alice", 10, 0)]).await;
    let mut broken = inbound("vless-broken", vec![]);
    broken.enable = false;
    broken.settings = "{oops".to_string();
    fx.store.upsert_inbound(&broken).unwrap();

    let report = fx.enforcer.tick().await.unwrap();
    assert_eq!(report.skipped_inbounds, 1);
    assert!(report.disabled.is_empty());
}

async fn flaky_enforcer(store: &Arc<FlakyStore>) -> (Arc<FakeCore>, PolicyEnforcer, mpsc::Sender<LimitExceeded>) {
    let shared: SharedStore = store.clone();
    let core = FakeCore::new();
    let sup = supervisor(&core, 3);
    let compiler = Compiler::new(&core_config()).unwrap();
    let reconciler = Arc::new(Reconciler::new(shared.clone(), compiler, sup));
    reconciler.reconcile(Trigger::Startup).await.unwrap();

    let (tx, rx) = mpsc::channel(16);
    (core, PolicyEnforcer::new(shared, reconciler, rx), tx)
}

fn over_limit(email: &str) -> LimitExceeded {
    LimitExceeded {
        email: email.into(),
        distinct_ips: 5,
        limit: 2,
    }
}

#[tokio::test]
async fn test_ip_limit_survives_failed_store_read() {
    let store = FlakyStore::with(&[inbound("vless-443", vec![client("alice", 0, 0), client("bob", 0, 0)])]);
    let (core, enforcer, ip_events) = flaky_enforcer(&store).await;
    ip_events.send(over_limit("alice")).await.unwrap();

    store.fail_next_read.store(true, Ordering::SeqCst);
    assert!(enforcer.tick().await.is_err());

    let report = enforcer.tick().await.unwrap();
    assert_eq!(
        report.disabled,
        vec![DisabledClient {
            email: "alice".into(),
            reason: DisableReason::IpLimit,
        }]
    );
    assert_eq!(core.live_clients(), vec!["bob"]);
}

#[tokio::test]
async fn test_ip_limit_retried_after_failed_disable() {
    let store = FlakyStore::with(&[inbound("vless-443", vec![client("alice", 0, 0), client("bob", 0, 0)])]);
    let (core, enforcer, ip_events) = flaky_enforcer(&store).await;
    ip_events.send(over_limit("alice")).await.unwrap();

    store.fail_next_update.store(true, Ordering::SeqCst);
    let report = enforcer.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(report.disabled.is_empty());
    assert_eq!(report.reconcile, None);

    let report = enforcer.tick().await.unwrap();
    assert_eq!(report.disabled.len(), 1);
    assert_eq!(report.disabled[0].reason, DisableReason::IpLimit);
    assert_eq!(report.reconcile, Some(ReconcileOutcome::Reloaded));
    assert_eq!(core.live_clients(), vec!["bob"]);

    // Applied once; nothing is carried further.
    let report = enforcer.tick().await.unwrap();
    assert!(report.disabled.is_empty());
    assert_eq!(report.failed, 0);
}
