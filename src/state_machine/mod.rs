// State machine module for operation lifecycle
//
// Pure transition rules for the operation state machine. Persistence of the
// resulting state is owned by the OperationManager.

pub mod errors;
pub mod events;
pub mod operation_state_machine;
pub mod states;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::OperationEvent;
pub use operation_state_machine::OperationStateMachine;
pub use states::OperationState;
