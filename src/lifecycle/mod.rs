//! Process lifecycle: shutdown coordination and OS signals.
//!
//! # Data Flow
//! ```text
//! SIGTERM / Ctrl-C ──signals::wait_for_signal──▶ Shutdown::trigger
//!                                                     │
//!                              every job loop ◀───────┤ (broadcast)
//!                              admin server   ◀───────┘
//! ```
//!
//! # Design Decisions
//! - One broadcast channel; every long-running task holds a receiver
//! - The engine waits for job loops before the final flush and stop

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
