//! Polls the provisioner until the runtime operation it accepted has finished.

use crate::clients::{ProvisionerClient, RuntimeOperationState};
use crate::models::Operation;
use crate::orchestration::error_classifier::{ClassifiedError, ErrComponent, ErrReason};
use crate::orchestration::operation_manager::OperationManager;
use crate::orchestration::step::{has_timed_out, Step, StepResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

pub const CHECK_RUNTIME_STEP: &str = "Check_Runtime";

/// Delay before asking the provisioner again
pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct CheckRuntimeStep {
    manager: Arc<OperationManager>,
    provisioner: Arc<dyn ProvisionerClient>,
    timeout: Duration,
    poll_interval: Duration,
}

impl CheckRuntimeStep {
    pub fn new(
        manager: Arc<OperationManager>,
        provisioner: Arc<dyn ProvisionerClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            provisioner,
            timeout,
            poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn check_runtime_status(&self, operation: Operation) -> StepResult {
        if has_timed_out(&operation, self.timeout) {
            info!(
                updated_at = %operation.updated_at,
                "Operation has reached the time limit"
            );
            let err = ClassifiedError::fatal(format!(
                "operation has reached the time limit: {}s",
                self.timeout.as_secs()
            ))
            .with_component(ErrComponent::Provisioner)
            .with_reason(ErrReason::Timeout);
            return self.manager.operation_failed_with(operation, err).await;
        }

        let Some(provisioner_operation_id) = operation.provisioner_operation_id().map(str::to_owned)
        else {
            let err = ClassifiedError::fatal("Operation does not contain Provisioner Operation ID")
                .with_component(ErrComponent::InternalValidation);
            error!("{}", err);
            return self.manager.operation_failed_with(operation, err).await;
        };

        let global_account_id = &operation.provisioning_parameters().ers_context.global_account_id;
        let status = match self
            .provisioner
            .runtime_operation_status(global_account_id, &provisioner_operation_id)
            .await
        {
            Ok(status) => status,
            Err(err) => {
                error!("Call to provisioner RuntimeOperationStatus failed: {}", err);
                return StepResult::requeue(operation, self.poll_interval);
            }
        };
        info!(state = %status.state, "Provisioner returned operation status");

        match status.state {
            RuntimeOperationState::Succeeded => StepResult::advance(operation),
            RuntimeOperationState::InProgress | RuntimeOperationState::Pending => {
                StepResult::requeue(operation, self.poll_interval)
            }
            RuntimeOperationState::Failed => {
                let err = ClassifiedError::fatal(format!(
                    "provisioner client returns failed status: {}",
                    status.message.unwrap_or_default()
                ))
                .with_component(ErrComponent::Provisioner)
                .with_reason(ErrReason::RemoteRejected);
                self.manager.operation_failed_with(operation, err).await
            }
        }
    }
}

#[async_trait]
impl Step for CheckRuntimeStep {
    fn name(&self) -> &str {
        CHECK_RUNTIME_STEP
    }

    #[instrument(skip(self, operation), fields(operation_id = %operation.id(), runtime_id = ?operation.runtime_id()))]
    async fn run(&self, operation: Operation) -> StepResult {
        if operation.runtime_id().is_none() {
            let err = ClassifiedError::fatal("Runtime ID is empty")
                .with_component(ErrComponent::InternalValidation);
            error!("{}", err);
            return self.manager.operation_failed_with(operation, err).await;
        }
        self.check_runtime_status(operation).await
    }
}
