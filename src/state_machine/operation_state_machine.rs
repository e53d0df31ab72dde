use super::{
    errors::{StateMachineError, StateMachineResult},
    events::OperationEvent,
    states::OperationState,
};
use crate::models::Operation;
use tracing::debug;

/// Pure transition table for operation states.
///
/// Persistence is the caller's concern: the `OperationManager` applies transitions
/// inside its update closures so a conflicting concurrent write re-evaluates the
/// transition against the fresh record.
pub struct OperationStateMachine;

impl OperationStateMachine {
    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: OperationState,
        event: &OperationEvent,
    ) -> StateMachineResult<OperationState> {
        let target = match (current_state, event) {
            (OperationState::Pending, OperationEvent::Start) => OperationState::InProgress,

            (OperationState::InProgress, OperationEvent::Retry) => OperationState::Retrying,
            (OperationState::Retrying, OperationEvent::Resume) => OperationState::InProgress,

            (OperationState::InProgress, OperationEvent::Fail(_)) => OperationState::Failed,
            (OperationState::Retrying, OperationEvent::Fail(_)) => OperationState::Failed,
            (OperationState::Canceling, OperationEvent::Fail(_)) => OperationState::Failed,

            (OperationState::InProgress, OperationEvent::Succeed) => OperationState::Succeeded,

            (OperationState::InProgress, OperationEvent::Cancel) => OperationState::Canceling,
            (OperationState::Retrying, OperationEvent::Cancel) => OperationState::Canceling,
            (OperationState::Canceling, OperationEvent::CancelComplete) => {
                OperationState::Canceled
            }

            (from, event) => {
                return Err(StateMachineError::InvalidTransition {
                    from,
                    event: event.event_type(),
                })
            }
        };

        Ok(target)
    }

    /// Apply `event` to the in-memory operation.
    ///
    /// Clears `last_error` whenever the target state may not carry one.
    pub fn apply(operation: &mut Operation, event: &OperationEvent) -> StateMachineResult<OperationState> {
        if operation.state.is_terminal() {
            return Err(StateMachineError::AlreadyTerminal {
                operation_id: operation.id().to_string(),
                state: operation.state,
            });
        }

        let target = Self::determine_target_state(operation.state, event)?;
        debug!(
            operation_id = %operation.id(),
            from = %operation.state,
            to = %target,
            event = event.event_type(),
            "Operation state transition"
        );

        operation.state = target;
        if !target.allows_last_error() {
            operation.last_error = None;
        }
        Ok(target)
    }
}
