//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EngineConfig (validated, immutable)
//!     → cloned into each component at engine construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require an engine restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//!
//! This is the engine's own configuration. The proxy configuration it
//! renders lives in the record store and flows through `compiler`.

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::AdminConfig;
pub use schema::CoreConfig;
pub use schema::EngineConfig;
pub use schema::IntervalConfig;
pub use schema::IpLimitConfig;
pub use schema::ObservabilityConfig;
pub use schema::RestartConfig;
pub use schema::StoreConfig;
pub use schema::TimeoutConfig;
