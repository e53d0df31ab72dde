//! # Operation Model
//!
//! Durable record of a single runtime lifecycle workflow.
//!
//! ## Overview
//!
//! An `Operation` is the unit processed by the step pipeline. It is created when a
//! caller requests a lifecycle change for a runtime instance, mutated by steps via the
//! `OperationManager` as the pipeline advances, and retained after reaching a terminal
//! state for audit.
//!
//! ## Field Ownership
//!
//! - **Identity** (`id`, `instance_id`, `operation_type`, `created_at`,
//!   `provisioning_parameters`): private, exposed through getters, never change.
//! - **Engine-managed** (`state`, `cursor`, `updated_at`, `version`, `last_error`,
//!   `retry_count`, `retry_started_at`): changed only by the `OperationManager`.
//! - **Step-owned** (`provisioner_operation_id`, `runtime_id`, `description`): set by
//!   steps through `OperationManager::update_operation` closures.

use crate::orchestration::error_classifier::{ClassifiedError, ErrComponent, ErrReason};
use crate::state_machine::OperationState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    #[serde(rename = "provision")]
    Provision,
    #[serde(rename = "deprovision")]
    Deprovision,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "upgradeKyma")]
    UpgradeKyma,
    #[serde(rename = "upgradeCluster")]
    UpgradeCluster,
}

impl OperationType {
    pub const ALL: [OperationType; 5] = [
        Self::Provision,
        Self::Deprovision,
        Self::Update,
        Self::UpgradeKyma,
        Self::UpgradeCluster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
            Self::Update => "update",
            Self::UpgradeKyma => "upgradeKyma",
            Self::UpgradeCluster => "upgradeCluster",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid operation type: {s}"))
    }
}

/// Account context captured from the request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErsContext {
    pub global_account_id: String,
    pub subaccount_id: String,
}

/// Immutable snapshot of the request parameters taken at creation time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningParameters {
    pub plan_id: String,
    pub ers_context: ErsContext,
    pub region: Option<String>,
    pub platform_region: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl ProvisioningParameters {
    pub fn new(plan_id: impl Into<String>, global_account_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            ers_context: ErsContext {
                global_account_id: global_account_id.into(),
                subaccount_id: String::new(),
            },
            ..Default::default()
        }
    }
}

/// Position of an operation inside its pipeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineCursor {
    pub stage: String,
    pub step: String,
}

impl PipelineCursor {
    pub fn new(stage: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            step: step.into(),
        }
    }
}

impl fmt::Display for PipelineCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stage, self.step)
    }
}

/// Last classified failure recorded on an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub component: Option<ErrComponent>,
    pub reason: Option<ErrReason>,
    pub message: String,
}

impl LastError {
    /// Metric label for the failing component, empty when unclassified
    pub fn component_label(&self) -> &'static str {
        self.component.map(|c| c.as_str()).unwrap_or("")
    }

    /// Metric label for the failure reason, empty when unclassified
    pub fn reason_label(&self) -> &'static str {
        self.reason.map(|r| r.as_str()).unwrap_or("")
    }
}

impl From<&ClassifiedError> for LastError {
    fn from(err: &ClassifiedError) -> Self {
        Self {
            component: err.component(),
            reason: err.reason(),
            message: err.to_string(),
        }
    }
}

/// A persisted lifecycle workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    id: String,
    instance_id: String,
    operation_type: OperationType,
    created_at: DateTime<Utc>,
    provisioning_parameters: ProvisioningParameters,

    pub state: OperationState,
    pub cursor: Option<PipelineCursor>,
    pub updated_at: DateTime<Utc>,
    /// Compare-and-swap token, bumped by storage on every successful update
    pub version: u64,
    pub last_error: Option<LastError>,
    pub retry_count: u32,
    pub retry_started_at: Option<DateTime<Utc>>,

    pub provisioner_operation_id: Option<String>,
    pub runtime_id: Option<String>,
    pub description: String,
}

impl Operation {
    /// Create a new pending operation with a generated id
    pub fn new(
        instance_id: impl Into<String>,
        operation_type: OperationType,
        provisioning_parameters: ProvisioningParameters,
    ) -> Self {
        Self::with_id(
            Uuid::new_v4().to_string(),
            instance_id,
            operation_type,
            provisioning_parameters,
        )
    }

    pub fn with_id(
        id: impl Into<String>,
        instance_id: impl Into<String>,
        operation_type: OperationType,
        provisioning_parameters: ProvisioningParameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            instance_id: instance_id.into(),
            operation_type,
            created_at: now,
            provisioning_parameters,
            state: OperationState::Pending,
            cursor: None,
            updated_at: now,
            version: 0,
            last_error: None,
            retry_count: 0,
            retry_started_at: None,
            provisioner_operation_id: None,
            runtime_id: None,
            description: "Operation created".to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn provisioning_parameters(&self) -> &ProvisioningParameters {
        &self.provisioning_parameters
    }

    /// Runtime id if one has been allocated
    pub fn runtime_id(&self) -> Option<&str> {
        self.runtime_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Provisioner operation id if the provisioner accepted a request
    pub fn provisioner_operation_id(&self) -> Option<&str> {
        self.provisioner_operation_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    /// Time elapsed since the last persisted mutation
    pub fn time_since_update(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.updated_at)
    }

    /// Whether the identity fields of `other` match this record
    pub fn same_identity(&self, other: &Operation) -> bool {
        self.id == other.id
            && self.instance_id == other.instance_id
            && self.operation_type == other.operation_type
            && self.created_at == other.created_at
            && self.provisioning_parameters == other.provisioning_parameters
    }

    /// Next `updated_at` value that keeps the timestamp strictly increasing
    pub(crate) fn next_update_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let floor = self.updated_at + chrono::Duration::microseconds(1);
        now.max(floor)
    }
}
