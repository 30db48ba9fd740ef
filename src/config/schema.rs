//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the supervision engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Managed proxy-core binary and its control surface.
    pub core: CoreConfig,

    /// Persistent record store.
    pub store: StoreConfig,

    /// Periodic job intervals.
    pub intervals: IntervalConfig,

    /// Source-IP concurrency tracking.
    pub ip_limit: IpLimitConfig,

    /// Restart policy applied after crashes.
    pub restart: RestartConfig,

    /// Timeouts for lifecycle operations.
    pub timeouts: TimeoutConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Proxy-core process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Path to the core executable.
    pub binary_path: PathBuf,

    /// Where the rendered JSON document is written before launch.
    pub config_path: PathBuf,

    /// Access log the core writes and the IP tracker tails.
    pub access_log_path: PathBuf,

    /// Core log level written into the rendered document.
    pub log_level: String,

    /// Loopback address of the core's API inbound.
    pub api_listen: String,

    /// Port of the core's API inbound (stats queries and liveness probe).
    pub api_port: u16,

    /// Optional JSON template providing outbounds/routing extras.
    pub template_path: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("bin/xray"),
            config_path: PathBuf::from("bin/config.json"),
            access_log_path: PathBuf::from("access.log"),
            log_level: "warning".to_string(),
            api_listen: "127.0.0.1".to_string(),
            api_port: 62789,
            template_path: None,
        }
    }
}

impl CoreConfig {
    /// `host:port` of the API inbound.
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_listen, self.api_port)
    }
}

/// Record store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("corewarden.db"),
        }
    }
}

/// Intervals of the periodic jobs, in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub health_check_secs: u64,
    pub stats_poll_secs: u64,
    pub ledger_flush_secs: u64,
    pub ip_scan_secs: u64,
    pub policy_secs: u64,

    /// Safety-net reconcile; on-demand requests run immediately.
    pub reconcile_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            health_check_secs: 10,
            stats_poll_secs: 10,
            ledger_flush_secs: 30,
            ip_scan_secs: 20,
            policy_secs: 30,
            reconcile_secs: 60,
        }
    }
}

impl IntervalConfig {
    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }

    pub fn stats_poll(&self) -> Duration {
        Duration::from_secs(self.stats_poll_secs)
    }

    pub fn ledger_flush(&self) -> Duration {
        Duration::from_secs(self.ledger_flush_secs)
    }

    pub fn ip_scan(&self) -> Duration {
        Duration::from_secs(self.ip_scan_secs)
    }

    pub fn policy(&self) -> Duration {
        Duration::from_secs(self.policy_secs)
    }

    pub fn reconcile(&self) -> Duration {
        Duration::from_secs(self.reconcile_secs)
    }
}

/// Source-IP concurrency tracking.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IpLimitConfig {
    /// Enable access-log tailing and IP-limit enforcement.
    pub enabled: bool,

    /// Trailing window in which distinct IPs are counted.
    pub window_secs: u64,

    /// Limit applied to clients without their own `limitIp` (0 = unlimited).
    pub default_limit: u32,
}

impl Default for IpLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 120,
            default_limit: 0,
        }
    }
}

impl IpLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Restart policy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Consecutive failed restarts before the engine gives up.
    pub max_consecutive_failures: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_consecutive_failures: 5,
        }
    }
}

/// Timeout configuration for lifecycle operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Spawning the process.
    pub launch_secs: u64,

    /// Time allowed for the first successful liveness probe after launch.
    pub health_check_secs: u64,

    /// A single liveness probe.
    pub probe_ms: u64,

    /// Graceful termination before the process is killed.
    pub grace_secs: u64,

    /// A single stats query.
    pub query_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            launch_secs: 10,
            health_check_secs: 10,
            probe_ms: 1_000,
            grace_secs: 5,
            query_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn launch(&self) -> Duration {
        Duration::from_secs(self.launch_secs)
    }

    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
