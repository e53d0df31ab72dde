use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation state definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Created, not yet picked up by the scheduler
    #[default]
    Pending,
    /// Steps are being executed
    InProgress,
    /// Final step completed cleanly
    Succeeded,
    /// Non-recoverable failure or exhausted retry budget
    Failed,
    /// Cancel request observed, cancellation steps running
    Canceling,
    /// Cancellation steps completed
    Canceled,
    /// Waiting out a retry interval after a recoverable failure
    Retrying,
}

impl OperationState {
    pub const ALL: [OperationState; 7] = [
        Self::Pending,
        Self::InProgress,
        Self::Succeeded,
        Self::Failed,
        Self::Canceling,
        Self::Canceled,
        Self::Retrying,
    ];

    /// Check if this is a terminal state (no further steps run)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Check if this state may carry a `last_error`
    pub fn allows_last_error(&self) -> bool {
        matches!(self, Self::Failed | Self::Retrying)
    }

    /// Check if steps are actively running for this state
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress | Self::Retrying | Self::Canceling)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Invalid operation state: {s}"))
    }
}
