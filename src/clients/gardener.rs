use super::ClientResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Provisioner-side record of a runtime's cluster
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cluster {
    pub runtime_id: String,
    /// Gardener shoot name
    pub name: String,
    /// Raw admin kubeconfig; absent until the shoot is reachable
    pub kubeconfig: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shoot {
    pub name: String,
    pub hibernated: bool,
}

#[async_trait]
pub trait ClusterRepository: Send + Sync {
    async fn get_cluster(&self, runtime_id: &str) -> ClientResult<Cluster>;
}

/// Gardener shoot API
#[async_trait]
pub trait ShootClient: Send + Sync {
    async fn get_shoot(&self, name: &str) -> ClientResult<Shoot>;
}
