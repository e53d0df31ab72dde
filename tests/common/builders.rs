//! Test fixtures: operations, configuration and a scheduler harness over the
//! in-memory store.

use super::fakes::RecordingSink;
use runtime_lifecycle::config::LifecycleConfig;
use runtime_lifecycle::models::{Operation, OperationType, ProvisioningParameters};
use runtime_lifecycle::orchestration::{OperationManager, Scheduler, StagedPipeline};
use runtime_lifecycle::state_machine::OperationState;
use runtime_lifecycle::storage::{InMemoryOperations, Operations};
use std::sync::Arc;

pub const GLOBAL_ACCOUNT_ID: &str = "ga-1";
pub const PLAN_ID: &str = "plan-azure";

pub fn operation(operation_type: OperationType) -> Operation {
    let mut parameters = ProvisioningParameters::new(PLAN_ID, GLOBAL_ACCOUNT_ID);
    parameters.ers_context.subaccount_id = "sa-1".to_string();
    parameters.region = Some("westeurope".to_string());
    Operation::new("instance-1", operation_type, parameters)
}

/// Short intervals so scheduler loops finish quickly
pub fn test_config() -> LifecycleConfig {
    let mut config = LifecycleConfig::default();
    config.scheduler.workers = 2;
    config.scheduler.poll_interval_ms = 10;
    config.scheduler.lease_seconds = 30;
    config.backoff.base_delay_seconds = 1;
    config.backoff.max_delay_seconds = 5;
    config.manager.persist_failure_delay_seconds = 1;
    config
}

pub struct Harness {
    pub storage: Arc<InMemoryOperations>,
    pub manager: Arc<OperationManager>,
    pub sink: Arc<RecordingSink>,
    pub config: LifecycleConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: LifecycleConfig) -> Self {
        let storage = Arc::new(InMemoryOperations::new());
        let manager = Arc::new(OperationManager::with_config(
            storage.clone(),
            config.manager.clone(),
        ));
        Self {
            storage,
            manager,
            sink: Arc::new(RecordingSink::default()),
            config,
        }
    }

    pub fn scheduler(&self, pipelines: Vec<StagedPipeline>) -> Scheduler {
        pipelines.into_iter().fold(
            Scheduler::new(self.manager.clone(), self.sink.clone(), &self.config),
            Scheduler::with_pipeline,
        )
    }

    pub async fn stored(&self, id: &str) -> Operation {
        self.storage.get(id).await.expect("operation is stored")
    }

    /// Persist `operation` directly in `state`, bypassing the scheduler
    pub async fn insert_in_state(&self, mut operation: Operation, state: OperationState) -> Operation {
        operation.state = state;
        self.storage.insert(&operation).await.expect("insert");
        operation
    }
}
