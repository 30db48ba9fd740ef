//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All components produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or config)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields over formatted messages
//! - Metrics are cheap (atomic increments) and safe to record with no
//!   exporter installed

pub mod logging;
pub mod metrics;
