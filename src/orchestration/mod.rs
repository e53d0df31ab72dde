//! # Orchestration Engine
//!
//! Step pipeline execution for runtime lifecycle operations.
//!
//! ## Core Components
//!
//! - **Scheduler**: worker pool claiming due operations and driving them through their pipeline
//! - **StagedPipeline**: ordered stages of steps per operation type, plus an optional cancellation stage
//! - **OperationManager**: the single write path for operation records
//! - **Step**: unit of work returning a `StepResult` (advance, requeue or error)
//! - **BackoffPolicy**: retry delay calculation for recoverable step errors
//! - **ClassifiedError**: errors tagged with component, reason and recoverability

pub mod backoff;
pub mod error_classifier;
pub mod operation_manager;
pub mod pipeline;
pub mod scheduler;
pub mod step;

pub use backoff::BackoffPolicy;
pub use error_classifier::{
    classify, is_non_recoverable, mark_non_recoverable, ClassifiedError, ErrComponent, ErrReason,
};
pub use operation_manager::OperationManager;
pub use pipeline::{NextPosition, PipelineError, StagedPipeline, StagedPipelineBuilder, CANCELLATION_STAGE};
pub use scheduler::{ProcessOutcome, Scheduler, SchedulerHandle};
pub use step::{has_timed_out, Step, StepResult};
