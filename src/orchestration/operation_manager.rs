//! # Operation Manager
//!
//! Single write path for operation records.
//!
//! ## Overview
//!
//! Steps and the scheduler never write to storage directly. Every mutation goes
//! through the manager, which:
//!
//! - applies state changes through [`OperationStateMachine`], so illegal transitions
//!   are rejected before anything is written,
//! - keeps `updated_at` strictly increasing,
//! - persists with compare-and-swap on `version`, re-reading and re-applying the
//!   mutation on conflict up to `manager.conflict_retries` times,
//! - clears `last_error` on every transition into a state that may not carry one.
//!
//! ## Persist Failures
//!
//! The step-facing helpers ([`OperationManager::operation_failed`],
//! [`OperationManager::operation_failed_with`],
//! [`OperationManager::operation_succeeded`], [`OperationManager::retry_operation`],
//! [`OperationManager::operation_canceled`]) never surface storage errors. When the
//! write fails they log it and hand back the unchanged operation with
//! `persist_failure_delay`, so the same step runs again later.

use crate::config::ManagerConfig;
use crate::models::{LastError, Operation, PipelineCursor};
use crate::orchestration::error_classifier::{
    ClassifiedError, ErrComponent, ErrReason,
};
use crate::orchestration::step::StepResult;
use crate::state_machine::{
    OperationEvent, OperationState, OperationStateMachine, StateMachineError,
};
use crate::storage::Operations;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Engine-owned fields a step's update closure may not change
struct EngineFields {
    state: OperationState,
    cursor: Option<PipelineCursor>,
    last_error: Option<LastError>,
    retry_count: u32,
    retry_started_at: Option<DateTime<Utc>>,
}

impl EngineFields {
    fn capture(operation: &Operation) -> Self {
        Self {
            state: operation.state,
            cursor: operation.cursor.clone(),
            last_error: operation.last_error.clone(),
            retry_count: operation.retry_count,
            retry_started_at: operation.retry_started_at,
        }
    }

    fn restore(self, operation: &mut Operation) {
        operation.state = self.state;
        operation.cursor = self.cursor;
        operation.last_error = self.last_error;
        operation.retry_count = self.retry_count;
        operation.retry_started_at = self.retry_started_at;
    }
}

pub struct OperationManager {
    storage: Arc<dyn Operations>,
    config: ManagerConfig,
}

impl OperationManager {
    pub fn new(storage: Arc<dyn Operations>) -> Self {
        Self::with_config(storage, ManagerConfig::default())
    }

    pub fn with_config(storage: Arc<dyn Operations>, config: ManagerConfig) -> Self {
        Self { storage, config }
    }

    pub fn storage(&self) -> &Arc<dyn Operations> {
        &self.storage
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub async fn get_operation(&self, id: &str) -> Result<Operation, ClassifiedError> {
        Ok(self.storage.get(id).await?)
    }

    /// Persist a freshly created operation
    #[instrument(skip(self, operation), fields(operation_id = %operation.id()))]
    pub async fn insert_operation(&self, operation: Operation) -> Result<Operation, ClassifiedError> {
        if operation.state != OperationState::Pending {
            return Err(ClassifiedError::fatal(format!(
                "new operations must be pending, got {}",
                operation.state
            ))
            .with_component(ErrComponent::InternalValidation)
            .with_reason(ErrReason::InvalidTransition));
        }

        self.storage.insert(&operation).await?;
        info!(
            instance_id = operation.instance_id(),
            operation_type = %operation.operation_type(),
            "Operation created"
        );
        Ok(operation)
    }

    /// Apply a step-level mutation and persist it.
    ///
    /// Only step-owned fields survive the closure; engine fields (state, cursor, retry
    /// bookkeeping, last error) are restored from the record being updated. On a version
    /// conflict the fresh record is re-read and the closure applied again.
    #[instrument(skip(self, operation, mutate), fields(operation_id = %operation.id()))]
    pub async fn update_operation<F>(
        &self,
        operation: Operation,
        mutate: F,
    ) -> Result<Operation, ClassifiedError>
    where
        F: Fn(&mut Operation) + Send + Sync,
    {
        self.persist(operation, |op| {
            let engine = EngineFields::capture(op);
            mutate(op);
            engine.restore(op);
            Ok(())
        })
        .await
    }

    /// Mark the operation Failed and return the non-recoverable error
    #[instrument(skip(self, operation, err), fields(operation_id = %operation.id()))]
    pub async fn operation_failed(
        &self,
        operation: Operation,
        description: &str,
        err: Option<ClassifiedError>,
    ) -> StepResult {
        let error = match err {
            Some(err) => err.context(description).non_recoverable(),
            None => ClassifiedError::fatal(description),
        };
        self.fail(operation, description, error).await
    }

    /// Mark the operation Failed for a condition the step detected itself.
    /// The error's message becomes the description.
    #[instrument(skip(self, operation, error), fields(operation_id = %operation.id()))]
    pub async fn operation_failed_with(&self, operation: Operation, error: ClassifiedError) -> StepResult {
        let description = error.message().to_string();
        self.fail(operation, &description, error.non_recoverable()).await
    }

    async fn fail(&self, operation: Operation, description: &str, error: ClassifiedError) -> StepResult {
        let last_error = LastError::from(&error);
        let event = OperationEvent::fail_with_error(error.message());

        let result = self
            .transition(operation.clone(), event, |op| {
                op.description = description.to_string();
                op.last_error = Some(last_error.clone());
            })
            .await;

        match result {
            Ok(stored) => {
                warn!(
                    error_component = last_error.component_label(),
                    error_reason = last_error.reason_label(),
                    "Operation failed: {}",
                    error
                );
                StepResult::error(stored, error)
            }
            Err(persist_err) => self.persist_failed(operation, persist_err),
        }
    }

    /// Mark the operation Succeeded
    #[instrument(skip(self, operation), fields(operation_id = %operation.id()))]
    pub async fn operation_succeeded(&self, operation: Operation, description: &str) -> StepResult {
        let result = self
            .transition(operation.clone(), OperationEvent::Succeed, |op| {
                op.description = description.to_string();
            })
            .await;

        match result {
            Ok(stored) => {
                info!("Operation succeeded");
                StepResult::advance(stored)
            }
            Err(persist_err) => self.persist_failed(operation, persist_err),
        }
    }

    /// Schedule a bounded retry.
    ///
    /// The budget is measured from `retry_started_at`, the first retry of the current
    /// episode. Once `max_time` is exceeded the operation fails instead.
    #[instrument(skip(self, operation, err), fields(operation_id = %operation.id(), retry_count = operation.retry_count))]
    pub async fn retry_operation(
        &self,
        operation: Operation,
        description: &str,
        err: Option<ClassifiedError>,
        retry_interval: Duration,
        max_time: Duration,
    ) -> StepResult {
        let now = Utc::now();
        let started = operation.retry_started_at.unwrap_or(now);
        let elapsed = now
            .signed_duration_since(started)
            .to_std()
            .unwrap_or_default();

        if elapsed > max_time {
            let message = format!(
                "{description}: retry time limit of {}s exceeded",
                max_time.as_secs()
            );
            return self.operation_failed(operation, &message, err).await;
        }

        let error = err.unwrap_or_else(|| ClassifiedError::new(description));
        let last_error = LastError::from(&error);
        let mutate = |op: &mut Operation| {
            op.retry_count = op.retry_count.saturating_add(1);
            op.retry_started_at = Some(started);
            op.description = description.to_string();
            if op.state.allows_last_error() {
                op.last_error = Some(last_error.clone());
            }
        };

        // Retrying and Canceling keep their state; only InProgress moves to Retrying
        let result = if operation.state == OperationState::InProgress {
            self.transition(operation.clone(), OperationEvent::Retry, mutate)
                .await
        } else {
            self.persist(operation.clone(), |op| {
                mutate(op);
                Ok(())
            })
            .await
        };

        match result {
            Ok(stored) => {
                debug!(
                    retry_count = stored.retry_count,
                    delay_ms = retry_interval.as_millis() as u64,
                    "Retrying operation: {}",
                    error
                );
                StepResult::requeue(stored, retry_interval.max(Duration::from_secs(1)))
            }
            Err(persist_err) => self.persist_failed(operation, persist_err),
        }
    }

    /// Pending → InProgress
    #[instrument(skip(self, operation), fields(operation_id = %operation.id()))]
    pub async fn start_operation(&self, operation: Operation) -> Result<Operation, ClassifiedError> {
        self.transition(operation, OperationEvent::Start, |op| {
            op.description = "Operation in progress".to_string();
        })
        .await
    }

    /// Retrying → InProgress
    #[instrument(skip(self, operation), fields(operation_id = %operation.id()))]
    pub async fn resume_operation(&self, operation: Operation) -> Result<Operation, ClassifiedError> {
        self.transition(operation, OperationEvent::Resume, |_| {}).await
    }

    /// InProgress/Retrying → Canceling
    #[instrument(skip(self, operation), fields(operation_id = %operation.id()))]
    pub async fn cancel_operation(&self, operation: Operation) -> Result<Operation, ClassifiedError> {
        self.transition(operation, OperationEvent::Cancel, |op| {
            op.description = "Operation canceling".to_string();
            op.cursor = None;
            op.retry_count = 0;
            op.retry_started_at = None;
        })
        .await
    }

    /// Canceling → Canceled
    #[instrument(skip(self, operation), fields(operation_id = %operation.id()))]
    pub async fn operation_canceled(&self, operation: Operation, description: &str) -> StepResult {
        let result = self
            .transition(operation.clone(), OperationEvent::CancelComplete, |op| {
                op.description = description.to_string();
            })
            .await;

        match result {
            Ok(stored) => {
                info!("Operation canceled");
                StepResult::advance(stored)
            }
            Err(persist_err) => self.persist_failed(operation, persist_err),
        }
    }

    /// Move the pipeline cursor and reset retry bookkeeping.
    ///
    /// Rejected with `InvalidTransition` if the state changed underneath, e.g. a
    /// cancel request landed while the step ran.
    #[instrument(skip(self, operation), fields(operation_id = %operation.id()))]
    pub async fn advance_cursor(
        &self,
        operation: Operation,
        cursor: Option<PipelineCursor>,
    ) -> Result<Operation, ClassifiedError> {
        let expected = operation.state;
        self.persist(operation, |op| {
            if op.state != expected {
                return Err(StateMachineError::InvalidTransition {
                    from: op.state,
                    event: "advance",
                }
                .into());
            }
            op.cursor = cursor.clone();
            op.retry_count = 0;
            op.retry_started_at = None;
            Ok(())
        })
        .await
    }

    async fn transition<F>(
        &self,
        operation: Operation,
        event: OperationEvent,
        mutate: F,
    ) -> Result<Operation, ClassifiedError>
    where
        F: Fn(&mut Operation) + Send + Sync,
    {
        self.persist(operation, |op| {
            OperationStateMachine::apply(op, &event)?;
            mutate(op);
            Ok(())
        })
        .await
    }

    async fn persist<F>(&self, operation: Operation, apply: F) -> Result<Operation, ClassifiedError>
    where
        F: Fn(&mut Operation) -> Result<(), ClassifiedError> + Send + Sync,
    {
        let id = operation.id().to_string();
        let mut current = operation;
        let mut attempt = 0;

        loop {
            let mut next = current.clone();
            apply(&mut next)?;
            next.updated_at = current.next_update_timestamp();
            next.version = current.version;

            match self.storage.update(&next).await {
                Ok(stored) => return Ok(stored),
                Err(err) if err.is_conflict() && attempt < self.config.conflict_retries => {
                    attempt += 1;
                    debug!(operation_id = %id, attempt, "Version conflict, re-reading operation");
                    current = self.storage.get(&id).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn persist_failed(&self, operation: Operation, err: ClassifiedError) -> StepResult {
        if err.reason() == Some(ErrReason::InvalidTransition) {
            warn!(
                operation_id = operation.id(),
                state = %operation.state,
                "Rejected state change: {}",
                err
            );
            return StepResult::error(operation, err);
        }

        error!(
            operation_id = operation.id(),
            "Unable to persist operation, step will run again: {}", err
        );
        StepResult::requeue(operation, self.config.persist_failure_delay())
    }
}
