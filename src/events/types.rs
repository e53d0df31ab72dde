use crate::models::{Operation, OperationType};
use crate::orchestration::error_classifier::{ClassifiedError, ErrComponent, ErrReason};
use crate::state_machine::OperationState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Operation fields carried by every lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub operation_id: String,
    pub instance_id: String,
    pub global_account_id: String,
    pub plan_id: String,
    pub operation_type: OperationType,
    pub state: OperationState,
}

impl From<&Operation> for OperationSnapshot {
    fn from(operation: &Operation) -> Self {
        let params = operation.provisioning_parameters();
        Self {
            operation_id: operation.id().to_string(),
            instance_id: operation.instance_id().to_string(),
            global_account_id: params.ers_context.global_account_id.clone(),
            plan_id: params.plan_id.clone(),
            operation_type: operation.operation_type(),
            state: operation.state,
        }
    }
}

/// One step invocation and its outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProcessed {
    pub operation: OperationSnapshot,
    pub step_name: String,
    pub duration: Duration,
    pub error_component: Option<ErrComponent>,
    pub error_reason: Option<ErrReason>,
}

impl StepProcessed {
    pub fn error_component_label(&self) -> &'static str {
        self.error_component.map(|c| c.as_str()).unwrap_or("")
    }

    pub fn error_reason_label(&self) -> &'static str {
        self.error_reason.map(|r| r.as_str()).unwrap_or("")
    }
}

/// Closed set of events the engine emits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LifecycleEvent {
    ProvisioningStepProcessed(StepProcessed),
    DeprovisioningStepProcessed(StepProcessed),
    UpdateStepProcessed(StepProcessed),
    UpgradeKymaStepProcessed(StepProcessed),
    UpgradeClusterStepProcessed(StepProcessed),
    OperationSucceeded(OperationSnapshot),
    /// Operation moved to Canceling on an external request
    CancellationRequested(OperationSnapshot),
    OperationCanceled(OperationSnapshot),
}

impl LifecycleEvent {
    /// Step event for `operation`, variant chosen by operation type.
    ///
    /// Error labels come from the step's error, falling back to the operation's
    /// recorded `last_error`.
    pub fn step_processed(
        operation: &Operation,
        step_name: &str,
        duration: Duration,
        error: Option<&ClassifiedError>,
    ) -> Self {
        let last_error = operation.last_error.as_ref();
        let processed = StepProcessed {
            operation: OperationSnapshot::from(operation),
            step_name: step_name.to_string(),
            duration,
            error_component: error
                .and_then(ClassifiedError::component)
                .or_else(|| last_error.and_then(|e| e.component)),
            error_reason: error
                .and_then(ClassifiedError::reason)
                .or_else(|| last_error.and_then(|e| e.reason)),
        };

        match operation.operation_type() {
            OperationType::Provision => Self::ProvisioningStepProcessed(processed),
            OperationType::Deprovision => Self::DeprovisioningStepProcessed(processed),
            OperationType::Update => Self::UpdateStepProcessed(processed),
            OperationType::UpgradeKyma => Self::UpgradeKymaStepProcessed(processed),
            OperationType::UpgradeCluster => Self::UpgradeClusterStepProcessed(processed),
        }
    }

    pub fn operation_succeeded(operation: &Operation) -> Self {
        Self::OperationSucceeded(OperationSnapshot::from(operation))
    }

    pub fn cancellation_requested(operation: &Operation) -> Self {
        Self::CancellationRequested(OperationSnapshot::from(operation))
    }

    pub fn operation_canceled(operation: &Operation) -> Self {
        Self::OperationCanceled(OperationSnapshot::from(operation))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ProvisioningStepProcessed(_) => "provisioning_step_processed",
            Self::DeprovisioningStepProcessed(_) => "deprovisioning_step_processed",
            Self::UpdateStepProcessed(_) => "update_step_processed",
            Self::UpgradeKymaStepProcessed(_) => "upgrade_kyma_step_processed",
            Self::UpgradeClusterStepProcessed(_) => "upgrade_cluster_step_processed",
            Self::OperationSucceeded(_) => "operation_succeeded",
            Self::CancellationRequested(_) => "cancellation_requested",
            Self::OperationCanceled(_) => "operation_canceled",
        }
    }

    pub fn operation(&self) -> &OperationSnapshot {
        match self {
            Self::ProvisioningStepProcessed(e)
            | Self::DeprovisioningStepProcessed(e)
            | Self::UpdateStepProcessed(e)
            | Self::UpgradeKymaStepProcessed(e)
            | Self::UpgradeClusterStepProcessed(e) => &e.operation,
            Self::OperationSucceeded(snapshot)
            | Self::CancellationRequested(snapshot)
            | Self::OperationCanceled(snapshot) => snapshot,
        }
    }

    pub fn step_processed_payload(&self) -> Option<&StepProcessed> {
        match self {
            Self::ProvisioningStepProcessed(e)
            | Self::DeprovisioningStepProcessed(e)
            | Self::UpdateStepProcessed(e)
            | Self::UpgradeKymaStepProcessed(e)
            | Self::UpgradeClusterStepProcessed(e) => Some(e),
            Self::OperationSucceeded(_)
            | Self::CancellationRequested(_)
            | Self::OperationCanceled(_) => None,
        }
    }
}
