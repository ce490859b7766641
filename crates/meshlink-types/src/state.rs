//! Service lifecycle state.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a MeshLink session.
///
/// `Error` and `Stopped` are terminal: a new facade is needed to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Init,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ServiceState {
    /// Whether no further transition back to `Running` is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether commands may be issued in this state.
    pub fn accepts_commands(self) -> bool {
        self == Self::Running
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}
