//! Process supervision and traffic accounting for a proxy panel.

pub mod admin;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod ip_tracker;
pub mod lifecycle;
pub mod observability;
pub mod policy;
pub mod reconciler;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod supervisor;

pub use config::EngineConfig;
pub use engine::Engine;
pub use lifecycle::Shutdown;
