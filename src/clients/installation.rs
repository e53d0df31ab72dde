use super::{ClientResult, KubeConfig};
use async_trait::async_trait;

/// Kyma installer running against the managed cluster
#[async_trait]
pub trait InstallationService: Send + Sync {
    /// Ask the in-cluster installer to remove Kyma; returns once the request is accepted
    async fn trigger_uninstall(&self, kubeconfig: &KubeConfig) -> ClientResult<()>;
}
