//! Process lifecycle state machine.
//!
//! # States
//! - Stopped: no process; initial state
//! - Starting: launched, waiting for the first successful probe
//! - Running: probe succeeded; stats and reconciles act on it
//! - Stopping: termination requested, waiting for exit
//! - Crashed: died unexpectedly or failed to start; restart policy applies
//!
//! # State Transitions
//! ```text
//! Stopped  → Starting: start
//! Starting → Running:  probe ok within the health-check timeout
//! Starting → Crashed:  launch error or health-check timeout
//! Running  → Stopping: stop / reload
//! Stopping → Stopped:  exit
//! Running  → Crashed:  unexpected exit
//! Crashed  → Starting: restart policy
//! ```

use std::fmt;

use serde::Serialize;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Crashed = 4,
}

impl From<u8> for ProcessState {
    fn from(val: u8) -> Self {
        match val {
            1 => ProcessState::Starting,
            2 => ProcessState::Running,
            3 => ProcessState::Stopping,
            4 => ProcessState::Crashed,
            _ => ProcessState::Stopped,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_round_trip_for_every_state() {
        for state in [
            ProcessState::Stopped,
            ProcessState::Starting,
            ProcessState::Running,
            ProcessState::Stopping,
            ProcessState::Crashed,
        ] {
            assert_eq!(ProcessState::from(state as u8), state);
        }
        assert_eq!(ProcessState::from(200), ProcessState::Stopped);
    }

    #[test]
    fn test_serializes_snake_case() {
        assert_eq!(serde_json::to_value(ProcessState::Crashed).unwrap(), "crashed");
    }
}
