mod common;

use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use corewarden::compiler::{Compiler, DesiredConfig};
use corewarden::supervisor::{ProcessState, SupervisorError, SupervisorEvent};

use common::*;

fn compile(records: &[corewarden::store::InboundRecord]) -> Arc<DesiredConfig> {
    let compiler = Compiler::new(&core_config()).unwrap();
    Arc::new(compiler.compile(records).unwrap())
}

#[tokio::test]
async fn test_busy_port_fails_launch_and_marks_crashed() {
    let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut record = inbound("vless-busy", vec![client("alice", 0, 0)]);
    record.port = blocker.local_addr().unwrap().port();
    let config = compile(&[record]);

    let core = FakeCore::new();
    let sup = supervisor(&core, 3);

    let err = sup.start(config).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Launch(_)));
    assert_eq!(sup.state(), ProcessState::Crashed);
    assert_eq!(core.launch_count(), 0);
    assert!(sup.running_config().is_none());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let core = FakeCore::new();
    let sup = supervisor(&core, 3);

    sup.stop().await.unwrap();
    sup.stop().await.unwrap();
    assert_eq!(sup.state(), ProcessState::Stopped);
    assert_eq!(core.terminates.load(Ordering::SeqCst), 0);

    let config = compile(&[inbound("vless-a", vec![client("alice", 0, 0)])]);
    sup.start(config.clone()).await.unwrap();
    assert_eq!(sup.state(), ProcessState::Running);
    assert_eq!(sup.running_config().unwrap().hash, config.hash);
    assert_eq!(sup.identity().unwrap().generation, 1);

    sup.stop().await.unwrap();
    sup.stop().await.unwrap();
    assert_eq!(sup.state(), ProcessState::Stopped);
    assert_eq!(core.terminates.load(Ordering::SeqCst), 1);
    assert!(sup.identity().is_none());
}

#[tokio::test]
async fn test_unhealthy_launch_times_out() {
    let core = FakeCore::new();
    core.never_healthy.store(true, Ordering::SeqCst);
    let sup = supervisor(&core, 3);

    let config = compile(&[inbound("vless-a", vec![client("alice", 0, 0)])]);
    let err = sup.start(config).await.unwrap_err();

    assert!(matches!(err, SupervisorError::HealthCheckTimeout(_)));
    assert_eq!(sup.state(), ProcessState::Crashed);
    assert_eq!(core.terminates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_crash_is_detected_and_restarted() {
    let core = FakeCore::new();
    let sup = supervisor(&core, 3);
    let mut events = sup.subscribe();

    let config = compile(&[inbound("vless-a", vec![client("alice", 0, 0)])]);
    sup.start(config.clone()).await.unwrap();
    assert!(sup.health_check().await);

    core.crash();
    assert!(!sup.health_check().await);
    assert_eq!(sup.state(), ProcessState::Crashed);
    assert!(sup.running_config().is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(sup.apply_restart_policy().await, Some(Ok(()))));
    assert_eq!(sup.state(), ProcessState::Running);
    assert_eq!(sup.identity().unwrap().generation, 2);
    assert_eq!(sup.running_config().unwrap().hash, config.hash);

    assert_eq!(events.recv().await.unwrap(), SupervisorEvent::Started { generation: 1 });
    assert_eq!(events.recv().await.unwrap(), SupervisorEvent::Crashed { generation: 1 });
    assert_eq!(events.recv().await.unwrap(), SupervisorEvent::Started { generation: 2 });
}

#[tokio::test]
async fn test_restart_budget_exhaustion_leaves_degraded() {
    let core = FakeCore::new();
    let sup = supervisor(&core, 2);

    let config = compile(&[inbound("vless-a", vec![client("alice", 0, 0)])]);
    sup.start(config).await.unwrap();
    core.crash();
    core.fail_launch.store(true, Ordering::SeqCst);
    assert!(!sup.health_check().await);

    let mut attempts = 0;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(15)).await;
        if let Some(result) = sup.apply_restart_policy().await {
            assert!(result.is_err());
            attempts += 1;
        }
        if sup.is_degraded() {
            break;
        }
    }

    assert_eq!(attempts, 2);
    assert!(sup.is_degraded());
    assert_eq!(sup.state(), ProcessState::Crashed);
    assert_eq!(sup.consecutive_failures(), 2);

    // No further attempts once exhausted.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sup.apply_restart_policy().await.is_none());
    assert_eq!(core.launch_count(), 1);
}

#[tokio::test]
async fn test_failed_reload_rolls_back() {
    let core = FakeCore::new();
    let sup = supervisor(&core, 3);

    let original = compile(&[inbound("vless-a", vec![client("alice", 0, 0)])]);
    sup.start(original.clone()).await.unwrap();

    let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut busy = inbound("vless-b", vec![client("bob", 0, 0)]);
    busy.port = blocker.local_addr().unwrap().port();
    let broken = compile(&[busy]);

    let err = sup.reload(broken).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Launch(_)));
    assert_eq!(sup.state(), ProcessState::Running);
    assert_eq!(sup.running_config().unwrap().hash, original.hash);
    assert_eq!(core.live_clients(), vec!["alice"]);

    // A later crash restarts what is actually running, not the failed config.
    core.crash();
    assert!(!sup.health_check().await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(sup.apply_restart_policy().await, Some(Ok(()))));
    assert_eq!(sup.running_config().unwrap().hash, original.hash);
    assert_eq!(core.live_clients(), vec!["alice"]);
}
