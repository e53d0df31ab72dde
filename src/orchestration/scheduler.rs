//! # Scheduler
//!
//! Drives operations through their pipelines.
//!
//! ## Overview
//!
//! A pool of tokio workers repeatedly claims due operations from storage under a
//! lease, runs them through [`Scheduler::process`] and releases them with the next
//! due time. All progress lives in the persisted record, so a restarted scheduler
//! resumes every operation where it stopped.
//!
//! ## Step Result Interpretation
//!
//! For each step invocation:
//!
//! - step already moved the operation to a terminal state: stop
//! - non-recoverable error: `operation_failed`, stop
//! - recoverable error: `retry_operation` with the backoff delay for the current
//!   retry count; the retry budget turns it into a failure once exhausted
//! - delay > 0: requeue after the delay
//! - otherwise: move the cursor; continue in the same tick, or requeue for the
//!   longer of the entered stage's buffer and the buffer the step asked for; after
//!   the last step the operation succeeds (or, while canceling, becomes canceled)
//!
//! A `StepProcessed` event is emitted after every invocation, `OperationSucceeded`
//! or `OperationCanceled` when the pipeline ends, and `CancellationRequested` when
//! a cancel is accepted. A failed delivery never changes when the operation runs
//! next.
//!
//! ## Exclusivity
//!
//! Leases keep two workers from running the same operation; the version CAS in
//! storage rejects writes from a worker whose lease expired mid-step.

use crate::config::{LifecycleConfig, SchedulerConfig};
use crate::error::{LifecycleError, Result};
use crate::events::{EventError, EventSink, LifecycleEvent};
use crate::logging;
use crate::models::{Operation, OperationType, PipelineCursor};
use crate::orchestration::backoff::BackoffPolicy;
use crate::orchestration::error_classifier::{ClassifiedError, ErrComponent, ErrReason};
use crate::orchestration::operation_manager::OperationManager;
use crate::orchestration::pipeline::{NextPosition, StagedPipeline};
use crate::orchestration::step::{Step, StepResult};
use crate::state_machine::OperationState;
use crate::storage::Operations;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What to do with an operation after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Terminal; remove from the due queue
    Done,
    /// Run again after the delay
    Requeue(Duration),
}

enum Flow {
    Continue(Operation),
    Stop(ProcessOutcome),
}

pub struct Scheduler {
    manager: Arc<OperationManager>,
    storage: Arc<dyn Operations>,
    events: Arc<dyn EventSink>,
    pipelines: HashMap<OperationType, Arc<StagedPipeline>>,
    backoff: BackoffPolicy,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        manager: Arc<OperationManager>,
        events: Arc<dyn EventSink>,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            storage: manager.storage().clone(),
            manager,
            events,
            pipelines: HashMap::new(),
            backoff: BackoffPolicy::from(&config.backoff),
            config: config.scheduler.clone(),
        }
    }

    /// Register the pipeline for its operation type, replacing any previous one
    pub fn with_pipeline(mut self, pipeline: StagedPipeline) -> Self {
        self.pipelines
            .insert(pipeline.operation_type(), Arc::new(pipeline));
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn manager(&self) -> &Arc<OperationManager> {
        &self.manager
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Persist a new operation and make it due immediately
    #[instrument(skip(self, operation), fields(operation_id = %operation.id()))]
    pub async fn enqueue(&self, operation: Operation) -> Result<Operation> {
        if !self.pipelines.contains_key(&operation.operation_type()) {
            return Err(LifecycleError::PipelineNotFound(operation.operation_type()));
        }

        let operation = self.manager.insert_operation(operation).await?;
        self.storage.schedule(operation.id(), Utc::now()).await?;
        Ok(operation)
    }

    /// Move an in-flight operation to Canceling and make it due immediately
    #[instrument(skip(self))]
    pub async fn request_cancel(&self, operation_id: &str) -> Result<Operation> {
        let operation = self.storage.get(operation_id).await?;
        let canceling = self.manager.cancel_operation(operation).await?;
        self.storage.schedule(operation_id, Utc::now()).await?;
        info!(operation_id = operation_id, "Cancellation requested");
        self.events
            .publish(LifecycleEvent::cancellation_requested(&canceling))
            .await?;
        Ok(canceling)
    }

    /// Operations currently due, for diagnostics
    pub async fn due_operations(&self) -> Result<Vec<Operation>> {
        Ok(self.storage.list_due(Utc::now()).await?)
    }

    /// Spawn the worker pool
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let instance = Uuid::new_v4();

        let workers = (0..self.config.workers)
            .map(|index| {
                let scheduler = Arc::clone(&self);
                let shutdown = shutdown_rx.clone();
                let owner = format!("{}-{}-{}", self.config.worker_id_prefix, instance, index);
                tokio::spawn(async move { scheduler.run_worker(owner, shutdown).await })
            })
            .collect();

        info!(workers = self.config.workers, "Scheduler started");
        SchedulerHandle {
            shutdown: shutdown_tx,
            workers,
        }
    }

    async fn run_worker(&self, owner: String, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %owner, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = match self.run_once(&owner).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!(worker = %owner, "Claim round failed: {}", err);
                    0
                }
            };

            if claimed == 0 {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            }
        }

        debug!(worker = %owner, "Worker stopped");
    }

    /// Claim one batch of due operations as `owner` and process it
    pub async fn run_once(&self, owner: &str) -> Result<usize> {
        let claimed = self
            .storage
            .claim_due(
                Utc::now(),
                owner,
                self.config.lease(),
                self.config.claim_batch_size,
            )
            .await?;

        let count = claimed.len();
        for operation in claimed {
            self.handle_claimed(owner, operation).await;
        }
        Ok(count)
    }

    async fn handle_claimed(&self, owner: &str, operation: Operation) {
        let id = operation.id().to_string();

        let (outcome, undelivered) = self.drive(operation).await;
        if let Some(err) = undelivered {
            error!(operation_id = %id, "Event delivery failed: {}", err);
        }
        let next_due = match outcome {
            ProcessOutcome::Done => None,
            ProcessOutcome::Requeue(delay) => Some(due_after(delay)),
        };

        match self.storage.release(&id, owner, next_due).await {
            Ok(true) => {}
            Ok(false) => warn!(operation_id = %id, worker = owner, "Lease was lost before release"),
            Err(err) => error!(operation_id = %id, "Failed to release operation: {}", err),
        }
    }

    /// Run `operation` until it is terminal or has to wait.
    ///
    /// An error means an event could not be delivered (a contract violation); the
    /// operation record is still consistent and was persisted as processed.
    pub async fn process(&self, operation: Operation) -> Result<ProcessOutcome> {
        match self.drive(operation).await {
            (_, Some(err)) => Err(err.into()),
            (outcome, None) => Ok(outcome),
        }
    }

    /// Processing outcome plus the first event that could not be delivered
    #[instrument(skip(self, operation), fields(operation_id = %operation.id(), operation_type = %operation.operation_type()))]
    async fn drive(&self, operation: Operation) -> (ProcessOutcome, Option<EventError>) {
        let mut operation = operation;
        let mut undelivered = None;

        loop {
            if operation.state.is_terminal() {
                return (ProcessOutcome::Done, undelivered);
            }

            operation = match operation.state {
                OperationState::Pending => {
                    match self.manager.start_operation(operation.clone()).await {
                        Ok(started) => started,
                        Err(err) => return (self.setback(&operation, &err), undelivered),
                    }
                }
                OperationState::Retrying => {
                    match self.manager.resume_operation(operation.clone()).await {
                        Ok(resumed) => resumed,
                        Err(err) => return (self.setback(&operation, &err), undelivered),
                    }
                }
                _ => operation,
            };

            let Some(pipeline) = self.pipelines.get(&operation.operation_type()).cloned() else {
                let err = ClassifiedError::fatal(format!(
                    "no pipeline registered for {} operations",
                    operation.operation_type()
                ))
                .with_component(ErrComponent::InternalValidation)
                .with_reason(ErrReason::Internal);
                let result = self
                    .manager
                    .operation_failed(operation, "Pipeline resolution failed", Some(err))
                    .await;
                return (self.outcome_of(&result), undelivered);
            };

            let canceling = operation.state == OperationState::Canceling;
            let Some(cursor) = operation
                .cursor
                .clone()
                .or_else(|| pipeline.first_cursor(canceling))
            else {
                // Canceling without a cancellation stage
                let result = self
                    .manager
                    .operation_canceled(operation, "Operation canceled")
                    .await;
                self.emit_finished(&result.operation, &mut undelivered).await;
                return (self.outcome_of(&result), undelivered);
            };

            let Some(step) = pipeline.step_at(&cursor, canceling).cloned() else {
                let err = ClassifiedError::fatal(format!("unknown pipeline position {cursor}"))
                    .with_component(ErrComponent::InternalValidation)
                    .with_reason(ErrReason::Internal);
                let result = self
                    .manager
                    .operation_failed(operation, "Pipeline resolution failed", Some(err))
                    .await;
                self.emit_step(
                    &result.operation,
                    &cursor.step,
                    Duration::ZERO,
                    result.error.as_ref(),
                    &mut undelivered,
                )
                .await;
                return (self.outcome_of(&result), undelivered);
            };

            debug!(cursor = %cursor, state = %operation.state, "Running step");
            let started = Instant::now();
            let result = self.invoke(step.as_ref(), operation).await;
            let elapsed = started.elapsed();

            match self
                .interpret(
                    &pipeline,
                    &cursor,
                    canceling,
                    step.name(),
                    elapsed,
                    result,
                    &mut undelivered,
                )
                .await
            {
                // Stop at the first undelivered event; the next run picks up from here
                Flow::Continue(_) if undelivered.is_some() => {
                    return (ProcessOutcome::Requeue(Duration::ZERO), undelivered)
                }
                Flow::Continue(next) => operation = next,
                Flow::Stop(outcome) => return (outcome, undelivered),
            }
        }
    }

    async fn invoke(&self, step: &dyn Step, operation: Operation) -> StepResult {
        let fallback = operation.clone();

        match AssertUnwindSafe(step.run(operation)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    operation_id = fallback.id(),
                    step = step.name(),
                    "Step panicked: {}",
                    message
                );
                let err =
                    ClassifiedError::fatal(format!("step {} panicked: {message}", step.name()))
                        .with_component(ErrComponent::InternalValidation)
                        .with_reason(ErrReason::StepPanicked);
                StepResult::error(fallback, err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn interpret(
        &self,
        pipeline: &StagedPipeline,
        cursor: &PipelineCursor,
        canceling: bool,
        step_name: &str,
        elapsed: Duration,
        result: StepResult,
        undelivered: &mut Option<EventError>,
    ) -> Flow {
        let StepResult {
            operation,
            delay,
            buffer: step_buffer,
            error,
        } = result;

        if let Some(err) = error {
            if operation.state.is_terminal() {
                self.emit_step(&operation, step_name, elapsed, Some(&err), undelivered)
                    .await;
                return Flow::Stop(ProcessOutcome::Done);
            }
            if err.reason() == Some(ErrReason::InvalidTransition) {
                self.emit_step(&operation, step_name, elapsed, Some(&err), undelivered)
                    .await;
                return Flow::Stop(self.setback(&operation, &err));
            }

            let description = format!("step {step_name} failed");
            let handled = if err.is_recoverable() {
                let retry_interval = self.backoff.delay_for(operation.retry_count);
                self.manager
                    .retry_operation(
                        operation,
                        &description,
                        Some(err),
                        retry_interval,
                        self.backoff.max_retry_time,
                    )
                    .await
            } else {
                self.manager
                    .operation_failed(operation, &description, Some(err))
                    .await
            };

            self.emit_step(
                &handled.operation,
                step_name,
                elapsed,
                handled.error.as_ref(),
                undelivered,
            )
            .await;
            return Flow::Stop(self.outcome_of(&handled));
        }

        self.emit_step(&operation, step_name, elapsed, None, undelivered)
            .await;

        if operation.state.is_terminal() {
            return Flow::Stop(ProcessOutcome::Done);
        }
        if !delay.is_zero() {
            return Flow::Stop(ProcessOutcome::Requeue(delay));
        }

        match pipeline
            .next_after(cursor, canceling)
            .unwrap_or(NextPosition::Finished)
        {
            NextPosition::Finished => {
                let finished = if canceling {
                    self.manager
                        .operation_canceled(operation, "Operation canceled")
                        .await
                } else {
                    self.manager
                        .operation_succeeded(operation, "Operation succeeded")
                        .await
                };

                self.emit_finished(&finished.operation, undelivered).await;
                Flow::Stop(self.outcome_of(&finished))
            }
            NextPosition::Step {
                cursor: next,
                buffer: stage_buffer,
            } => {
                let advanced = match self
                    .manager
                    .advance_cursor(operation.clone(), Some(next.clone()))
                    .await
                {
                    Ok(advanced) => advanced,
                    Err(err) => return Flow::Stop(self.setback(&operation, &err)),
                };
                debug!(from = %cursor, to = %next, "Advanced pipeline cursor");

                let wait = stage_buffer.unwrap_or_default().max(step_buffer);
                if wait.is_zero() {
                    Flow::Continue(advanced)
                } else {
                    Flow::Stop(ProcessOutcome::Requeue(wait))
                }
            }
        }
    }

    fn outcome_of(&self, result: &StepResult) -> ProcessOutcome {
        if result.operation.state.is_terminal() {
            return ProcessOutcome::Done;
        }
        match &result.error {
            Some(err) => self.setback(&result.operation, err),
            None => ProcessOutcome::Requeue(result.delay),
        }
    }

    /// Requeue after a manager call could not be applied
    fn setback(&self, operation: &Operation, err: &ClassifiedError) -> ProcessOutcome {
        if err.reason() == Some(ErrReason::InvalidTransition) {
            warn!(
                operation_id = operation.id(),
                state = %operation.state,
                "Operation changed concurrently, retrying with the stored record: {}",
                err
            );
            ProcessOutcome::Requeue(self.config.poll_interval())
        } else {
            error!(
                operation_id = operation.id(),
                "Unable to update operation: {}", err
            );
            ProcessOutcome::Requeue(self.manager.config().persist_failure_delay())
        }
    }

    async fn emit_step(
        &self,
        operation: &Operation,
        step_name: &str,
        elapsed: Duration,
        error: Option<&ClassifiedError>,
        undelivered: &mut Option<EventError>,
    ) {
        logging::log_step_processed(
            operation.id(),
            step_name,
            elapsed.as_millis() as u64,
            operation.state.as_str(),
            error.map(ClassifiedError::message),
        );
        self.emit(
            LifecycleEvent::step_processed(operation, step_name, elapsed, error),
            undelivered,
        )
        .await;
    }

    /// Terminal event for a pipeline that ran to its end
    async fn emit_finished(&self, operation: &Operation, undelivered: &mut Option<EventError>) {
        let event = match operation.state {
            OperationState::Succeeded => LifecycleEvent::operation_succeeded(operation),
            OperationState::Canceled => LifecycleEvent::operation_canceled(operation),
            _ => return,
        };
        self.emit(event, undelivered).await;
    }

    /// Publish `event`, keeping the first failure
    async fn emit(&self, event: LifecycleEvent, undelivered: &mut Option<EventError>) {
        let name = event.name();
        if let Err(err) = self.events.publish(event).await {
            warn!(event = name, "Event was not delivered: {}", err);
            undelivered.get_or_insert(err);
        }
    }
}

/// Running worker pool
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal all workers and wait for in-flight operations to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!("Scheduler worker terminated abnormally: {}", err);
            }
        }
        info!("Scheduler stopped");
    }
}

fn due_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
