//! Shared fixtures for integration tests: a scriptable core and store helpers.

#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use corewarden::config::{CoreConfig, RestartConfig, TimeoutConfig};
use corewarden::store::{
    ClientTraffic, ConfigStore, InboundRecord, SharedStore, SqliteStore, StoreError, StoreResult,
    TrafficDelta,
};
use corewarden::supervisor::{
    ControlError, CoreControl, CounterKind, CounterSample, ProcessHandle, Supervisor,
};

/// In-memory stand-in for the core binary.
pub struct FakeCore {
    pub launches: AtomicUsize,
    pub terminates: AtomicUsize,
    pub alive: AtomicBool,
    pub fail_launch: AtomicBool,
    pub never_healthy: AtomicBool,
    pub launch_delay: Mutex<Duration>,
    counters: Mutex<Vec<CounterSample>>,
    documents: Mutex<Vec<Value>>,
}

impl FakeCore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            terminates: AtomicUsize::new(0),
            alive: AtomicBool::new(false),
            fail_launch: AtomicBool::new(false),
            never_healthy: AtomicBool::new(false),
            launch_delay: Mutex::new(Duration::ZERO),
            counters: Mutex::new(Vec::new()),
            documents: Mutex::new(Vec::new()),
        })
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Simulate the process dying on its own.
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn set_counters(&self, samples: Vec<CounterSample>) {
        *self.counters.lock().unwrap() = samples;
    }

    pub fn last_document(&self) -> Option<Value> {
        self.documents.lock().unwrap().last().cloned()
    }

    /// Emails of every client in the last launched document.
    pub fn live_clients(&self) -> Vec<String> {
        let Some(doc) = self.last_document() else {
            return Vec::new();
        };
        let mut emails: Vec<String> = doc["inbounds"]
            .as_array()
            .into_iter()
            .flatten()
            .flat_map(|inbound| inbound["settings"]["clients"].as_array().cloned().unwrap_or_default())
            .filter_map(|client| client["email"].as_str().map(str::to_string))
            .collect();
        emails.sort();
        emails
    }
}

#[async_trait]
impl CoreControl for FakeCore {
    async fn launch(&self, document: &Value) -> Result<ProcessHandle, ControlError> {
        let delay = *self.launch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(ControlError::BinaryUnavailable("fake core refuses to start".into()));
        }
        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        self.documents.lock().unwrap().push(document.clone());
        self.alive.store(true, Ordering::SeqCst);
        Ok(ProcessHandle::new(Some(40_000 + n as u32)))
    }

    async fn terminate(&self, _handle: &ProcessHandle, _grace: Duration) -> Result<(), ControlError> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self, _handle: &ProcessHandle) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.never_healthy.load(Ordering::SeqCst)
    }

    async fn query_traffic(&self, _handle: &ProcessHandle) -> Result<Vec<CounterSample>, ControlError> {
        Ok(self.counters.lock().unwrap().clone())
    }

    fn counter_kind(&self) -> CounterKind {
        CounterKind::Cumulative
    }
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Timeouts short enough for tests.
pub fn fast_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        launch_secs: 2,
        health_check_secs: 1,
        probe_ms: 200,
        grace_secs: 1,
        query_secs: 2,
    }
}

pub fn fast_restarts(max_failures: u32) -> RestartConfig {
    RestartConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        max_consecutive_failures: max_failures,
    }
}

pub fn supervisor(core: &Arc<FakeCore>, max_failures: u32) -> Arc<Supervisor> {
    let control: Arc<dyn CoreControl> = core.clone();
    Arc::new(Supervisor::new(control, fast_timeouts(), &fast_restarts(max_failures)))
}

pub fn core_config() -> CoreConfig {
    CoreConfig {
        api_listen: "127.0.0.1".to_string(),
        api_port: free_port(),
        ..CoreConfig::default()
    }
}

/// Client entry for an inbound's settings JSON.
pub fn client(email: &str, total_bytes: u64, expiry_time: i64) -> Value {
    json!({
        "id": format!("uuid-{}", email),
        "email": email,
        "enable": true,
        "totalBytes": total_bytes,
        "expiryTime": expiry_time,
        "limitIp": 0,
    })
}

/// Inbound on a free loopback port.
pub fn inbound(tag: &str, clients: Vec<Value>) -> InboundRecord {
    let settings = json!({ "clients": clients, "decryption": "none" });
    let mut record = InboundRecord::new(tag, "vless", free_port(), &settings.to_string());
    record.listen = "127.0.0.1".to_string();
    record
}

pub fn store_with(records: &[InboundRecord]) -> SharedStore {
    let store = SqliteStore::open_in_memory().unwrap();
    for record in records {
        store.upsert_inbound(record).unwrap();
    }
    Arc::new(store)
}

/// Store whose next read or next client update can be made to fail.
pub struct FlakyStore {
    inner: SqliteStore,
    pub fail_next_read: AtomicBool,
    pub fail_next_update: AtomicBool,
}

impl FlakyStore {
    pub fn with(records: &[InboundRecord]) -> Arc<Self> {
        let inner = SqliteStore::open_in_memory().unwrap();
        for record in records {
            inner.upsert_inbound(record).unwrap();
        }
        Arc::new(Self {
            inner,
            fail_next_read: AtomicBool::new(false),
            fail_next_update: AtomicBool::new(false),
        })
    }

    fn injected(flag: &AtomicBool) -> StoreResult<()> {
        if flag.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Task("injected failure".into()));
        }
        Ok(())
    }
}

impl ConfigStore for FlakyStore {
    fn list_inbounds(&self) -> StoreResult<Vec<InboundRecord>> {
        Self::injected(&self.fail_next_read)?;
        self.inner.list_inbounds()
    }

    fn list_client_traffic(&self) -> StoreResult<Vec<ClientTraffic>> {
        self.inner.list_client_traffic()
    }

    fn update_client_enabled(&self, email: &str, enabled: bool) -> StoreResult<()> {
        Self::injected(&self.fail_next_update)?;
        self.inner.update_client_enabled(email, enabled)
    }

    fn increment_persisted_traffic(&self, deltas: &[TrafficDelta]) -> StoreResult<()> {
        self.inner.increment_persisted_traffic(deltas)
    }

    fn upsert_inbound(&self, record: &InboundRecord) -> StoreResult<i64> {
        self.inner.upsert_inbound(record)
    }
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
