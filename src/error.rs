use crate::config::ConfigurationError;
use crate::events::EventError;
use crate::models::OperationType;
use crate::orchestration::error_classifier::ClassifiedError;
use crate::orchestration::pipeline::PipelineError;
use crate::state_machine::StateMachineError;
use crate::storage::StorageError;
use thiserror::Error;

/// Crate-level error for engine contract violations and infrastructure failures
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("State transition error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Operation error: {0}")]
    Operation(#[from] ClassifiedError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("No pipeline registered for {0} operations")]
    PipelineNotFound(OperationType),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
