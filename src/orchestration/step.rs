//! # Step Contract
//!
//! A step is one idempotent unit of work inside a pipeline stage.
//!
//! ## Result Protocol
//!
//! [`Step::run`] returns a [`StepResult`]; its `delay` and `error` are read by the
//! scheduler as follows:
//!
//! | `delay` | `error` | Meaning |
//! |---|---|---|
//! | zero | `None` | step complete, advance to the next step |
//! | zero, `buffer` > 0 | `None` | step complete, wait `buffer` before the next step |
//! | > 0 | `None` | run the same step again after `delay` |
//! | any | recoverable | retry with backoff inside the retry budget |
//! | any | non-recoverable | operation failed, stop |
//!
//! Steps never sleep. Long waits are expressed as a returned delay so the worker is
//! released and the wait survives restarts.
//!
//! Steps are re-run after crashes and lease expiry, so they must detect earlier
//! progress from the operation's fields (e.g. a stored provisioner operation id)
//! instead of repeating external side effects.

use crate::models::Operation;
use crate::orchestration::error_classifier::ClassifiedError;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

/// Outcome of a single step invocation
#[derive(Debug, Clone)]
pub struct StepResult {
    pub operation: Operation,
    pub delay: Duration,
    /// Minimum wait before the next step; the longer of this and the stage buffer wins
    pub buffer: Duration,
    pub error: Option<ClassifiedError>,
}

impl StepResult {
    /// Step finished, move on
    pub fn advance(operation: Operation) -> Self {
        Self::advance_after(operation, Duration::ZERO)
    }

    /// Step finished; the next step must not start before `buffer` has passed
    pub fn advance_after(operation: Operation, buffer: Duration) -> Self {
        Self {
            operation,
            delay: Duration::ZERO,
            buffer,
            error: None,
        }
    }

    /// Run the same step again after `delay`
    pub fn requeue(operation: Operation, delay: Duration) -> Self {
        Self {
            operation,
            delay,
            buffer: Duration::ZERO,
            error: None,
        }
    }

    pub fn error(operation: Operation, error: ClassifiedError) -> Self {
        Self {
            operation,
            delay: Duration::ZERO,
            buffer: Duration::ZERO,
            error: Some(error),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.delay.is_zero()
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    /// Stable step name, used as the pipeline cursor and as a metric label
    fn name(&self) -> &str;

    async fn run(&self, operation: Operation) -> StepResult;
}

/// Whether `operation` has gone longer than `timeout` without a persisted change
pub fn has_timed_out(operation: &Operation, timeout: Duration) -> bool {
    let elapsed = Utc::now().signed_duration_since(operation.updated_at);
    elapsed.to_std().map_or(false, |elapsed| elapsed > timeout)
}
