//! Minimal kubeconfig model, enough to locate the API server and credentials of the
//! current context.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KubeConfigError {
    #[error("error constructing kubeconfig from raw config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("kubeconfig is invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEndpoint {
    pub server: String,
    #[serde(rename = "certificate-authority-data", default)]
    pub certificate_authority_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEndpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRef {
    pub cluster: String,
    #[serde(default)]
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: serde_yaml::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KubeConfig {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub current_context: String,
    #[serde(default)]
    pub users: Vec<NamedUser>,
}

impl KubeConfig {
    /// Parse a raw kubeconfig document
    pub fn from_raw(raw: &str) -> Result<Self, KubeConfigError> {
        let config: KubeConfig = serde_yaml::from_str(raw)?;
        if config.clusters.is_empty() {
            return Err(KubeConfigError::Invalid("no clusters defined".to_string()));
        }
        if !config.current_context.is_empty() && config.current().is_none() {
            return Err(KubeConfigError::Invalid(format!(
                "current context {} does not resolve to a cluster",
                config.current_context
            )));
        }
        Ok(config)
    }

    /// Cluster selected by the current context, or the first cluster if none is set
    pub fn current(&self) -> Option<&NamedCluster> {
        if self.current_context.is_empty() {
            return self.clusters.first();
        }
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == self.current_context)?;
        self.clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
    }

    /// API server URL of the current cluster
    pub fn server(&self) -> Option<&str> {
        self.current().map(|c| c.cluster.server.as_str())
    }
}
