//! # External Collaborators
//!
//! Trait seams for the services steps call. Concrete HTTP/Kubernetes clients live
//! outside this crate; tests use hand-written fakes.

use thiserror::Error;

pub mod gardener;
pub mod installation;
pub mod kubeconfig;
pub mod provisioner;

pub use gardener::{Cluster, ClusterRepository, Shoot, ShootClient};
pub use installation::InstallationService;
pub use kubeconfig::{KubeConfig, KubeConfigError};
pub use provisioner::{
    ProvisionRuntimeInput, ProvisionRuntimeResponse, ProvisionerClient, RuntimeOperationState,
    RuntimeOperationStatus,
};

/// Failure returned by a collaborator call
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or server-side failure, worth retrying
    #[error("request failed: {0}")]
    Transport(String),

    /// The remote service refused the request
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    /// Whether repeating the same call may succeed
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout | Self::Other(_))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
