//! # Lifecycle Steps
//!
//! Concrete steps and the pipelines they are assembled into.
//!
//! | Operation | Stages |
//! |---|---|
//! | provision | `create_runtime` → `check_runtime` (buffered by the status poll interval) |
//! | update | `check_runtime` |
//! | deprovision | `trigger_kyma_uninstall` → follow-up stages |
//!
//! After a real uninstall trigger the follow-up stages wait for the uninstall delay;
//! the step requests that wait itself, so skipped uninstalls continue at once.

use crate::clients::{ClusterRepository, InstallationService, ProvisionerClient, ShootClient};
use crate::config::TimeoutsConfig;
use crate::models::OperationType;
use crate::orchestration::operation_manager::OperationManager;
use crate::orchestration::pipeline::{PipelineError, StagedPipeline};
use crate::orchestration::step::Step;
use std::sync::Arc;
use std::time::Duration;

pub mod check_runtime;
pub mod create_runtime;
pub mod trigger_uninstall;

pub use check_runtime::{CheckRuntimeStep, CHECK_RUNTIME_STEP};
pub use create_runtime::{CreateRuntimeStep, CREATE_RUNTIME_STEP};
pub use trigger_uninstall::{TriggerKymaUninstallStep, TRIGGER_KYMA_UNINSTALL_STEP};

/// External services the built-in steps talk to
#[derive(Clone)]
pub struct Collaborators {
    pub provisioner: Arc<dyn ProvisionerClient>,
    pub clusters: Arc<dyn ClusterRepository>,
    pub shoots: Arc<dyn ShootClient>,
    pub installation: Arc<dyn InstallationService>,
}

pub fn provisioning_pipeline(
    create: Arc<CreateRuntimeStep>,
    check: Arc<CheckRuntimeStep>,
    first_poll_after: Duration,
) -> Result<StagedPipeline, PipelineError> {
    StagedPipeline::builder(OperationType::Provision)
        .stage("create_runtime", Duration::ZERO, vec![create as Arc<dyn Step>])
        .stage("check_runtime", first_poll_after, vec![check as Arc<dyn Step>])
        .build()
}

pub fn update_pipeline(check: Arc<CheckRuntimeStep>) -> Result<StagedPipeline, PipelineError> {
    StagedPipeline::builder(OperationType::Update)
        .stage("check_runtime", Duration::ZERO, vec![check as Arc<dyn Step>])
        .build()
}

/// Uninstall Kyma, then run `followups`
pub fn deprovisioning_pipeline(
    uninstall: Arc<TriggerKymaUninstallStep>,
    followups: Vec<Arc<dyn Step>>,
) -> Result<StagedPipeline, PipelineError> {
    let builder = StagedPipeline::builder(OperationType::Deprovision).stage(
        "trigger_kyma_uninstall",
        Duration::ZERO,
        vec![uninstall as Arc<dyn Step>],
    );

    if followups.is_empty() {
        builder.build()
    } else {
        builder
            .stage("deprovision_cluster", Duration::ZERO, followups)
            .build()
    }
}

/// Provision, update and deprovision pipelines wired with the built-in steps
pub fn default_pipelines(
    manager: Arc<OperationManager>,
    collaborators: &Collaborators,
    timeouts: &TimeoutsConfig,
) -> Result<Vec<StagedPipeline>, PipelineError> {
    let create = Arc::new(CreateRuntimeStep::new(
        manager.clone(),
        collaborators.provisioner.clone(),
    ));
    let check_provisioning = Arc::new(
        CheckRuntimeStep::new(
            manager.clone(),
            collaborators.provisioner.clone(),
            timeouts.provisioning(),
        )
        .with_poll_interval(timeouts.status_poll_interval()),
    );
    let check_update = Arc::new(
        CheckRuntimeStep::new(manager, collaborators.provisioner.clone(), timeouts.update())
            .with_poll_interval(timeouts.status_poll_interval()),
    );
    let uninstall = Arc::new(TriggerKymaUninstallStep::new(
        collaborators.clusters.clone(),
        collaborators.shoots.clone(),
        collaborators.installation.clone(),
        timeouts.kyma_uninstall(),
        timeouts.kyma_uninstall_delay(),
    ));

    Ok(vec![
        provisioning_pipeline(create, check_provisioning, timeouts.status_poll_interval())?,
        update_pipeline(check_update)?,
        deprovisioning_pipeline(uninstall, Vec::new())?,
    ])
}
