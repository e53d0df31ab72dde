//! Asks the Kyma installer inside the runtime's cluster to uninstall Kyma before the
//! cluster itself is deprovisioned.
//!
//! Nothing is called when there is nothing to uninstall from: no runtime, no
//! kubeconfig yet, or a hibernated shoot. Those paths advance immediately. Only a
//! real trigger asks the scheduler to hold the next step back for the configured
//! delay.

use crate::clients::{ClientError, ClusterRepository, InstallationService, KubeConfig, ShootClient};
use crate::models::Operation;
use crate::orchestration::error_classifier::{classify, ClassifiedError, ErrComponent, ErrReason};
use crate::orchestration::step::{has_timed_out, Step, StepResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const TRIGGER_KYMA_UNINSTALL_STEP: &str = "Trigger_Kyma_Uninstall";

pub struct TriggerKymaUninstallStep {
    clusters: Arc<dyn ClusterRepository>,
    shoots: Arc<dyn ShootClient>,
    installation: Arc<dyn InstallationService>,
    timeout: Duration,
    delay: Duration,
}

impl TriggerKymaUninstallStep {
    pub fn new(
        clusters: Arc<dyn ClusterRepository>,
        shoots: Arc<dyn ShootClient>,
        installation: Arc<dyn InstallationService>,
        timeout: Duration,
        delay: Duration,
    ) -> Self {
        Self {
            clusters,
            shoots,
            installation,
            timeout,
            delay,
        }
    }

    /// Wait after a successful trigger before deprovisioning continues
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns whether the installer was actually called
    async fn trigger(&self, operation: &Operation, runtime_id: &str) -> Result<bool, ClassifiedError> {
        let cluster = match self.clusters.get_cluster(runtime_id).await {
            Ok(cluster) => cluster,
            Err(ClientError::NotFound(_)) => {
                info!("No cluster registered for runtime, nothing to uninstall");
                return Ok(false);
            }
            Err(err) => {
                return Err(classify(err, ErrComponent::Db, None)
                    .context("error getting cluster for runtime"))
            }
        };

        let Some(raw_kubeconfig) = cluster.kubeconfig.as_deref().filter(|k| !k.is_empty()) else {
            info!(cluster = %cluster.name, "Cluster has no kubeconfig, skipping Kyma uninstall");
            return Ok(false);
        };

        let shoot = self
            .shoots
            .get_shoot(&cluster.name)
            .await
            .map_err(|err| classify(err, ErrComponent::ClusterClient, None))?;
        if shoot.hibernated {
            info!(shoot = %shoot.name, "Shoot is hibernated, skipping Kyma uninstall");
            return Ok(false);
        }

        let kubeconfig = KubeConfig::from_raw(raw_kubeconfig).map_err(|err| {
            classify(err, ErrComponent::ClusterK8sClient, Some(ErrReason::InvalidConfig))
                .context("error: failed to create kubernetes config from raw")
                .non_recoverable()
        })?;

        self.installation
            .trigger_uninstall(&kubeconfig)
            .await
            .map_err(|err| {
                classify(
                    err,
                    ErrComponent::KymaInstaller,
                    Some(ErrReason::TriggerKymaUninstall),
                )
                .context("error triggering Kyma uninstall")
            })?;

        info!(
            operation_id = operation.id(),
            server = kubeconfig.server().unwrap_or_default(),
            "Kyma uninstall triggered"
        );
        Ok(true)
    }
}

#[async_trait]
impl Step for TriggerKymaUninstallStep {
    fn name(&self) -> &str {
        TRIGGER_KYMA_UNINSTALL_STEP
    }

    #[instrument(skip(self, operation), fields(operation_id = %operation.id()))]
    async fn run(&self, operation: Operation) -> StepResult {
        if has_timed_out(&operation, self.timeout) {
            let err = ClassifiedError::fatal(format!(
                "operation has reached the time limit: {}s",
                self.timeout.as_secs()
            ))
            .with_component(ErrComponent::KymaInstaller)
            .with_reason(ErrReason::Timeout);
            return StepResult::error(operation, err);
        }

        let Some(runtime_id) = operation.runtime_id().map(str::to_owned) else {
            debug!("Operation has no runtime, skipping Kyma uninstall");
            return StepResult::advance(operation);
        };

        match self.trigger(&operation, &runtime_id).await {
            Ok(true) => StepResult::advance_after(operation, self.delay),
            Ok(false) => StepResult::advance(operation),
            Err(err) => {
                warn!(
                    error_component = err.component().map(|c| c.as_str()).unwrap_or_default(),
                    recoverable = err.is_recoverable(),
                    "Kyma uninstall step failed: {}",
                    err
                );
                StepResult::error(operation, err)
            }
        }
    }
}
