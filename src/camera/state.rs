//! Supervisor lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// ```text
/// UNINITIALIZED -> BACKEND_READY -> WORKER_RUNNING -> DEPENDENTS_RUNNING
///                                                          |      ^
///                                                          v      |
///                                                     MODE_CHANGING
/// any -> SHUTTING_DOWN (release)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorState {
    /// Nothing configured yet
    #[default]
    Uninitialized,
    /// Hardware configured, no worker
    BackendReady,
    /// Worker publishing, dependents down
    WorkerRunning,
    /// Worker and dependents up
    DependentsRunning,
    /// Reconfiguration in progress, or a failed one awaiting retry
    ModeChanging,
    /// Released; only `initialize` leaves this state
    ShuttingDown,
}

impl SupervisorState {
    /// The acquisition worker is expected to be up.
    pub fn worker_expected(self) -> bool {
        matches!(
            self,
            SupervisorState::WorkerRunning | SupervisorState::DependentsRunning
        )
    }

    /// A mode change may start from here.
    pub fn can_reconfigure(self) -> bool {
        matches!(
            self,
            SupervisorState::BackendReady
                | SupervisorState::WorkerRunning
                | SupervisorState::DependentsRunning
                | SupervisorState::ModeChanging
        )
    }

    /// Wire name, e.g. `DEPENDENTS_RUNNING`.
    pub fn as_str(self) -> &'static str {
        match self {
            SupervisorState::Uninitialized => "UNINITIALIZED",
            SupervisorState::BackendReady => "BACKEND_READY",
            SupervisorState::WorkerRunning => "WORKER_RUNNING",
            SupervisorState::DependentsRunning => "DEPENDENTS_RUNNING",
            SupervisorState::ModeChanging => "MODE_CHANGING",
            SupervisorState::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_the_wire_format() {
        assert_eq!(SupervisorState::ModeChanging.to_string(), "MODE_CHANGING");
        assert_eq!(
            serde_json::to_string(&SupervisorState::DependentsRunning).unwrap(),
            "\"DEPENDENTS_RUNNING\""
        );
        assert!(!SupervisorState::ShuttingDown.can_reconfigure());
        assert!(SupervisorState::ModeChanging.can_reconfigure());
    }
}
