//! Daemon lifecycle state shared between the session and the job watcher

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Current high-level activity of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DaemonState {
    #[default]
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "reporting")]
    Reporting,
    #[serde(rename = "splitting")]
    Splitting,
    #[serde(rename = "shutting down")]
    ShuttingDown,
}

impl DaemonState {
    /// Value of the `status` field in replies
    pub fn as_str(self) -> &'static str {
        match self {
            DaemonState::Idle => "idle",
            DaemonState::Reporting => "reporting",
            DaemonState::Splitting => "splitting",
            DaemonState::ShuttingDown => "shutting down",
        }
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thread-safe handle to the daemon state
pub type SharedState = Arc<RwLock<DaemonState>>;

pub fn new_shared_state() -> SharedState {
    Arc::new(RwLock::new(DaemonState::Idle))
}
