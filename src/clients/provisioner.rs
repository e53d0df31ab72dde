use super::ClientResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of an asynchronous provisioner operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeOperationState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl fmt::Display for RuntimeOperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOperationStatus {
    pub state: RuntimeOperationState,
    pub message: Option<String>,
}

/// Request body for a new runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRuntimeInput {
    pub runtime_name: String,
    pub instance_id: String,
    pub plan_id: String,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRuntimeResponse {
    pub operation_id: String,
    pub runtime_id: String,
}

/// Runtime provisioner API
#[async_trait]
pub trait ProvisionerClient: Send + Sync {
    async fn provision_runtime(
        &self,
        global_account_id: &str,
        subaccount_id: &str,
        input: ProvisionRuntimeInput,
    ) -> ClientResult<ProvisionRuntimeResponse>;

    async fn runtime_operation_status(
        &self,
        global_account_id: &str,
        operation_id: &str,
    ) -> ClientResult<RuntimeOperationStatus>;
}
