mod common;

use std::sync::Arc;
use std::time::Duration;

use corewarden::compiler::Compiler;
use corewarden::stats::{CollectOutcome, StatsCollector, TrafficLedger};
use corewarden::store::TrafficEntity;
use corewarden::supervisor::CounterSample;

use common::*;

fn alice(up: u64, down: u64) -> Vec<CounterSample> {
    vec![
        CounterSample::new(TrafficEntity::client("alice"), up, down),
        CounterSample::new(TrafficEntity::inbound("vless-443"), up, down),
    ]
}

#[tokio::test]
async fn test_collector_skips_when_core_not_running() {
    let core = FakeCore::new();
    let sup = supervisor(&core, 3);
    let ledger = Arc::new(TrafficLedger::new());
    let collector = StatsCollector::new(sup, ledger.clone());

    assert_eq!(collector.collect().await.unwrap(), CollectOutcome::Skipped);
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_restart_resets_baseline() {
    let core = FakeCore::new();
    let sup = supervisor(&core, 3);
    let ledger = Arc::new(TrafficLedger::new());
    let collector = StatsCollector::new(sup.clone(), ledger.clone());

    let compiler = Compiler::new(&core_config()).unwrap();
    let config = compiler
        .compile(&[inbound("vless-443", vec![client("alice", 0, 0)])])
        .unwrap();
    sup.start(Arc::new(config)).await.unwrap();

    core.set_counters(alice(100, 200));
    assert_eq!(
        collector.collect().await.unwrap(),
        CollectOutcome::Baselined { entities: 2 }
    );
    assert!(ledger.is_empty());

    core.set_counters(alice(150, 260));
    assert_eq!(collector.collect().await.unwrap(), CollectOutcome::Merged { deltas: 2 });
    let entry = ledger.get(&TrafficEntity::client("alice")).unwrap();
    assert_eq!((entry.up, entry.down), (50, 60));

    // The core dies and comes back with fresh counters.
    core.crash();
    assert!(!sup.health_check().await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(sup.apply_restart_policy().await, Some(Ok(()))));

    core.set_counters(alice(10, 10));
    assert_eq!(
        collector.collect().await.unwrap(),
        CollectOutcome::Baselined { entities: 2 }
    );
    let entry = ledger.get(&TrafficEntity::client("alice")).unwrap();
    assert_eq!((entry.up, entry.down), (50, 60));

    core.set_counters(alice(30, 15));
    collector.collect().await.unwrap();
    let entry = ledger.get(&TrafficEntity::client("alice")).unwrap();
    assert_eq!((entry.up, entry.down), (70, 65));
}

#[tokio::test]
async fn test_reload_keeps_traffic_since_last_poll() {
    let core = FakeCore::new();
    let sup = supervisor(&core, 3);
    let ledger = Arc::new(TrafficLedger::new());
    let collector = StatsCollector::new(sup.clone(), ledger.clone());

    let compiler = Compiler::new(&core_config()).unwrap();
    let first = compiler
        .compile(&[inbound("vless-443", vec![client("alice", 0, 0)])])
        .unwrap();
    let second = compiler
        .compile(&[inbound("vless-443", vec![client("alice", 0, 0), client("bob", 0, 0)])])
        .unwrap();
    sup.start(Arc::new(first)).await.unwrap();

    core.set_counters(alice(0, 0));
    collector.collect().await.unwrap();
    core.set_counters(alice(100, 100));
    collector.collect().await.unwrap();

    // Traffic after the last poll, then a stop-and-start reload.
    core.set_counters(alice(300, 300));
    sup.reload(Arc::new(second)).await.unwrap();
    assert_eq!(sup.identity().unwrap().generation, 2);

    core.set_counters(alice(50, 50));
    collector.collect().await.unwrap();
    let entry = ledger.get(&TrafficEntity::client("alice")).unwrap();
    assert_eq!((entry.up, entry.down), (300, 300));
    assert!(sup.take_final_readings().is_empty());

    core.set_counters(alice(80, 70));
    collector.collect().await.unwrap();
    let entry = ledger.get(&TrafficEntity::client("alice")).unwrap();
    assert_eq!((entry.up, entry.down), (330, 320));
}

#[tokio::test]
async fn test_stop_reading_is_collected_after_core_is_gone() {
    let core = FakeCore::new();
    let sup = supervisor(&core, 3);
    let ledger = Arc::new(TrafficLedger::new());
    let collector = StatsCollector::new(sup.clone(), ledger.clone());

    let compiler = Compiler::new(&core_config()).unwrap();
    let config = compiler
        .compile(&[inbound("vless-443", vec![client("alice", 0, 0)])])
        .unwrap();
    sup.start(Arc::new(config)).await.unwrap();

    core.set_counters(alice(10, 10));
    collector.collect().await.unwrap();
    core.set_counters(alice(25, 40));
    sup.stop().await.unwrap();

    assert_eq!(collector.collect().await.unwrap(), CollectOutcome::Merged { deltas: 2 });
    let entry = ledger.get(&TrafficEntity::client("alice")).unwrap();
    assert_eq!((entry.up, entry.down), (15, 30));
    assert_eq!(collector.collect().await.unwrap(), CollectOutcome::Skipped);
}
