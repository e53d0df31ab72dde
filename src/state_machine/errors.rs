use super::states::OperationState;
use crate::orchestration::error_classifier::{ClassifiedError, ErrComponent, ErrReason};
use thiserror::Error;

/// Error types for state machine operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition {
        from: OperationState,
        event: &'static str,
    },

    #[error("Operation {operation_id} is already in terminal state {state}")]
    AlreadyTerminal {
        operation_id: String,
        state: OperationState,
    },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

impl From<StateMachineError> for ClassifiedError {
    fn from(err: StateMachineError) -> Self {
        ClassifiedError::fatal(err.to_string())
            .with_component(ErrComponent::InternalValidation)
            .with_reason(ErrReason::InvalidTransition)
    }
}
