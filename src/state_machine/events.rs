use serde::{Deserialize, Serialize};

/// Triggers that move an operation between states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OperationEvent {
    /// Scheduler dequeued a pending operation
    Start,
    /// Step returned a recoverable error within the retry budget
    Retry,
    /// Retry interval elapsed
    Resume,
    /// Non-recoverable failure or exhausted budget
    Fail(String),
    /// Final step completed cleanly
    Succeed,
    /// External cancel request observed
    Cancel,
    /// Cancellation steps completed
    CancelComplete,
}

impl OperationEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Retry => "retry",
            Self::Resume => "resume",
            Self::Fail(_) => "fail",
            Self::Succeed => "succeed",
            Self::Cancel => "cancel",
            Self::CancelComplete => "cancel_complete",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Create a failure event with the given error message
    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
