//! Submits the runtime request to the provisioner.
//!
//! The provisioner operation id is persisted before the step reports completion, so
//! a re-run after a crash finds it and never submits a second request.
//!
//! Between the provisioner accepting the request and the id reaching storage there
//! is a window in which a crash or a storage outage loses the id. The step retries
//! the write a few times and then logs both ids at error level so the orphaned
//! runtime can be found. A later re-run submits a new request.

use crate::clients::{
    ClientError, ProvisionRuntimeInput, ProvisionRuntimeResponse, ProvisionerClient,
};
use crate::models::Operation;
use crate::orchestration::error_classifier::{classify, ClassifiedError, ErrComponent, ErrReason};
use crate::orchestration::operation_manager::OperationManager;
use crate::orchestration::step::{Step, StepResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const CREATE_RUNTIME_STEP: &str = "Create_Runtime";

/// Writes of the accepted provisioner ids before giving up
pub const STORE_ATTEMPTS: u32 = 3;

pub struct CreateRuntimeStep {
    manager: Arc<OperationManager>,
    provisioner: Arc<dyn ProvisionerClient>,
}

impl CreateRuntimeStep {
    pub fn new(manager: Arc<OperationManager>, provisioner: Arc<dyn ProvisionerClient>) -> Self {
        Self {
            manager,
            provisioner,
        }
    }

    async fn store_ids(
        &self,
        operation: &Operation,
        response: &ProvisionRuntimeResponse,
    ) -> Result<Operation, ClassifiedError> {
        let mut attempt = 1;
        loop {
            let result = self
                .manager
                .update_operation(operation.clone(), |op| {
                    op.provisioner_operation_id = Some(response.operation_id.clone());
                    op.runtime_id = Some(response.runtime_id.clone());
                    op.description = "Runtime creation requested".to_string();
                })
                .await;

            match result {
                Ok(updated) => return Ok(updated),
                Err(err) if attempt < STORE_ATTEMPTS => {
                    warn!(attempt, "Unable to store provisioner operation id, trying again: {}", err);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn runtime_input(operation: &Operation) -> ProvisionRuntimeInput {
        let parameters = operation.provisioning_parameters();
        ProvisionRuntimeInput {
            runtime_name: format!("runtime-{}", operation.instance_id()),
            instance_id: operation.instance_id().to_string(),
            plan_id: parameters.plan_id.clone(),
            region: parameters
                .region
                .clone()
                .or_else(|| parameters.platform_region.clone()),
        }
    }
}

#[async_trait]
impl Step for CreateRuntimeStep {
    fn name(&self) -> &str {
        CREATE_RUNTIME_STEP
    }

    #[instrument(skip(self, operation), fields(operation_id = %operation.id(), instance_id = %operation.instance_id()))]
    async fn run(&self, operation: Operation) -> StepResult {
        if let Some(existing) = operation.provisioner_operation_id() {
            info!(provisioner_operation_id = existing, "Runtime already requested");
            return StepResult::advance(operation);
        }

        let ers_context = &operation.provisioning_parameters().ers_context;
        let response = match self
            .provisioner
            .provision_runtime(
                &ers_context.global_account_id,
                &ers_context.subaccount_id,
                Self::runtime_input(&operation),
            )
            .await
        {
            Ok(response) => response,
            Err(err @ ClientError::Rejected(_)) => {
                warn!("Provisioner rejected the runtime request: {}", err);
                let err = classify(err, ErrComponent::Provisioner, Some(ErrReason::RemoteRejected))
                    .context("call to provisioner ProvisionRuntime failed")
                    .non_recoverable();
                return StepResult::error(operation, err);
            }
            Err(err) => {
                warn!("Call to provisioner ProvisionRuntime failed: {}", err);
                let err = classify(err, ErrComponent::Provisioner, None)
                    .context("call to provisioner ProvisionRuntime failed");
                return StepResult::error(operation, err);
            }
        };

        match self.store_ids(&operation, &response).await {
            Ok(updated) => {
                info!(
                    provisioner_operation_id = %response.operation_id,
                    runtime_id = %response.runtime_id,
                    "Runtime creation requested"
                );
                StepResult::advance(updated)
            }
            Err(err) => {
                error!(
                    provisioner_operation_id = %response.operation_id,
                    runtime_id = %response.runtime_id,
                    "Provisioner accepted the runtime request but its id was not stored: {}",
                    err
                );
                let err = err.context(format!(
                    "unable to store provisioner operation id {}",
                    response.operation_id
                ));
                StepResult::error(operation, err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClientResult, RuntimeOperationStatus};
    use crate::models::{OperationType, ProvisioningParameters};
    use crate::state_machine::OperationState;
    use crate::storage::{InMemoryOperations, Operations, StorageError, StorageResult};
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` writes, then delegates
    struct FlakyOperations {
        inner: InMemoryOperations,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Operations for FlakyOperations {
        async fn get(&self, id: &str) -> StorageResult<Operation> {
            self.inner.get(id).await
        }
        async fn insert(&self, operation: &Operation) -> StorageResult<()> {
            self.inner.insert(operation).await
        }
        async fn update(&self, operation: &Operation) -> StorageResult<Operation> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Database("connection reset".to_string()));
            }
            self.inner.update(operation).await
        }
        async fn list_due(&self, before: DateTime<Utc>) -> StorageResult<Vec<Operation>> {
            self.inner.list_due(before).await
        }
        async fn schedule(&self, id: &str, due_at: DateTime<Utc>) -> StorageResult<()> {
            self.inner.schedule(id, due_at).await
        }
        async fn claim_due(
            &self,
            before: DateTime<Utc>,
            owner: &str,
            lease: std::time::Duration,
            limit: usize,
        ) -> StorageResult<Vec<Operation>> {
            self.inner.claim_due(before, owner, lease, limit).await
        }
        async fn release(
            &self,
            id: &str,
            owner: &str,
            next_due: Option<DateTime<Utc>>,
        ) -> StorageResult<bool> {
            self.inner.release(id, owner, next_due).await
        }
    }

    async fn flaky_setup(
        failures: usize,
    ) -> (CreateRuntimeStep, Arc<RecordingProvisioner>, Arc<FlakyOperations>, Operation) {
        let provisioner = RecordingProvisioner::returning(Ok(ProvisionRuntimeResponse {
            operation_id: "prov-op-1".to_string(),
            runtime_id: "rt-1".to_string(),
        }));
        let storage = Arc::new(FlakyOperations {
            inner: InMemoryOperations::new(),
            failures: AtomicUsize::new(failures),
        });
        let mut operation = Operation::new(
            "instance-1",
            OperationType::Provision,
            ProvisioningParameters::new("plan-1", "ga-1"),
        );
        operation.state = OperationState::InProgress;
        storage.insert(&operation).await.unwrap();
        let manager = Arc::new(OperationManager::new(storage.clone()));
        let step = CreateRuntimeStep::new(manager, provisioner.clone());
        (step, provisioner, storage, operation)
    }

    struct RecordingProvisioner {
        response: Mutex<Option<ClientResult<ProvisionRuntimeResponse>>>,
        requests: Mutex<Vec<ProvisionRuntimeInput>>,
    }

    impl RecordingProvisioner {
        fn returning(response: ClientResult<ProvisionRuntimeResponse>) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(Some(response)),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProvisionerClient for RecordingProvisioner {
        async fn provision_runtime(
            &self,
            _global_account_id: &str,
            _subaccount_id: &str,
            input: ProvisionRuntimeInput,
        ) -> ClientResult<ProvisionRuntimeResponse> {
            self.requests.lock().push(input);
            self.response
                .lock()
                .take()
                .unwrap_or(Err(ClientError::Timeout))
        }

        async fn runtime_operation_status(
            &self,
            _global_account_id: &str,
            _operation_id: &str,
        ) -> ClientResult<RuntimeOperationStatus> {
            Err(ClientError::Timeout)
        }
    }

    async fn setup(
        provisioner: Arc<RecordingProvisioner>,
    ) -> (CreateRuntimeStep, Arc<InMemoryOperations>, Operation) {
        let storage = Arc::new(InMemoryOperations::new());
        let mut operation = Operation::new(
            "instance-1",
            OperationType::Provision,
            ProvisioningParameters::new("plan-1", "ga-1"),
        );
        operation.state = OperationState::InProgress;
        storage.insert(&operation).await.unwrap();
        let manager = Arc::new(OperationManager::new(storage.clone()));
        (CreateRuntimeStep::new(manager, provisioner), storage, operation)
    }

    #[tokio::test]
    async fn test_stores_provisioner_ids_and_advances() {
        let provisioner = RecordingProvisioner::returning(Ok(ProvisionRuntimeResponse {
            operation_id: "prov-op-1".to_string(),
            runtime_id: "rt-1".to_string(),
        }));
        let (step, storage, operation) = setup(provisioner.clone()).await;

        let result = step.run(operation.clone()).await;

        assert!(result.is_complete());
        let stored = storage.get(operation.id()).await.unwrap();
        assert_eq!(stored.provisioner_operation_id(), Some("prov-op-1"));
        assert_eq!(stored.runtime_id(), Some("rt-1"));
        assert_eq!(stored.state, OperationState::InProgress);

        let requests = provisioner.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].plan_id, "plan-1");
        assert_eq!(requests[0].instance_id, "instance-1");
    }

    #[tokio::test]
    async fn test_existing_request_is_not_resubmitted() {
        let provisioner = RecordingProvisioner::returning(Err(ClientError::Timeout));
        let (step, _storage, mut operation) = setup(provisioner.clone()).await;
        operation.provisioner_operation_id = Some("prov-op-1".to_string());

        let result = step.run(operation).await;

        assert!(result.is_complete());
        assert!(provisioner.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_is_recoverable() {
        let provisioner =
            RecordingProvisioner::returning(Err(ClientError::Transport("connection reset".to_string())));
        let (step, _storage, operation) = setup(provisioner).await;

        let result = step.run(operation).await;
        let err = result.error.unwrap();

        assert!(err.is_recoverable());
        assert_eq!(err.component(), Some(ErrComponent::Provisioner));
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_rejection_is_not_recoverable() {
        let provisioner =
            RecordingProvisioner::returning(Err(ClientError::Rejected("quota exceeded".to_string())));
        let (step, _storage, operation) = setup(provisioner).await;

        let result = step.run(operation).await;
        let err = result.error.unwrap();

        assert!(!err.is_recoverable());
        assert_eq!(err.reason(), Some(ErrReason::RemoteRejected));
        assert_eq!(result.operation.state, OperationState::InProgress);
    }

    #[tokio::test]
    async fn test_store_failure_after_acceptance_is_retried() {
        let (step, provisioner, storage, operation) = flaky_setup(STORE_ATTEMPTS as usize - 1).await;

        let result = step.run(operation.clone()).await;

        assert!(result.is_complete());
        assert_eq!(provisioner.requests.lock().len(), 1);
        let stored = storage.get(operation.id()).await.unwrap();
        assert_eq!(stored.provisioner_operation_id(), Some("prov-op-1"));
        assert_eq!(stored.runtime_id(), Some("rt-1"));
    }

    #[tokio::test]
    async fn test_store_outage_after_acceptance_reports_provisioner_id() {
        let (step, provisioner, storage, operation) = flaky_setup(STORE_ATTEMPTS as usize).await;

        let result = step.run(operation.clone()).await;

        let err = result.error.unwrap();
        assert!(err.is_recoverable());
        assert!(err.message().contains("prov-op-1"));
        assert_eq!(provisioner.requests.lock().len(), 1);
        assert_eq!(result.operation.provisioner_operation_id(), None);
        let stored = storage.get(operation.id()).await.unwrap();
        assert_eq!(stored.provisioner_operation_id(), None);
    }
}
