//! # Operation Result Collector
//!
//! Projects lifecycle events into one OpenTelemetry gauge per operation type.
//!
//! ## Gauges
//!
//! - `<prefix>.provisioning_result`
//! - `<prefix>.deprovisioning_result`
//! - `<prefix>.update_result`
//! - `<prefix>.upgrade_kyma_result`
//! - `<prefix>.upgrade_cluster_result`
//!
//! The gauge value is the operation's state after the step:
//! 0 Failed, 1 Succeeded, 2 InProgress, 3 Pending, 4 Canceling, 5 Canceled, 6 Retrying.
//!
//! Labels: `operation_id`, `instance_id`, `global_account_id`, `plan_id`, plus
//! `error_category` and `error_reason` on the provisioning and deprovisioning gauges
//! (empty when the operation carries no classified error).
//!
//! The collector remembers the last value of every in-flight operation. Finished
//! operations move to a bounded history of the most recent results.
//!
//! ## Usage
//!
//! ```rust
//! use runtime_lifecycle::events::{EventPublisher, OperationResultCollector};
//! use std::sync::Arc;
//!
//! let meter = opentelemetry::global::meter("runtime-lifecycle");
//! let collector = Arc::new(OperationResultCollector::new(&meter, "lifecycle"));
//!
//! let publisher = EventPublisher::new(1000);
//! publisher.register_handler(collector);
//! ```

use super::publisher::{EventError, EventHandler};
use super::types::{LifecycleEvent, OperationSnapshot, StepProcessed};
use crate::models::OperationType;
use crate::state_machine::OperationState;
use async_trait::async_trait;
use dashmap::DashMap;
use opentelemetry::metrics::{Gauge, Meter};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::trace;

/// Finished operations whose last result stays queryable
pub const DEFAULT_RESULT_HISTORY: usize = 1024;

pub const RESULT_FAILED: f64 = 0.0;
pub const RESULT_SUCCEEDED: f64 = 1.0;
pub const RESULT_IN_PROGRESS: f64 = 2.0;
pub const RESULT_PENDING: f64 = 3.0;
pub const RESULT_CANCELING: f64 = 4.0;
pub const RESULT_CANCELED: f64 = 5.0;
pub const RESULT_RETRYING: f64 = 6.0;

/// Gauge value for an operation state
pub fn result_value(state: OperationState) -> f64 {
    match state {
        OperationState::Failed => RESULT_FAILED,
        OperationState::Succeeded => RESULT_SUCCEEDED,
        OperationState::InProgress => RESULT_IN_PROGRESS,
        OperationState::Pending => RESULT_PENDING,
        OperationState::Canceling => RESULT_CANCELING,
        OperationState::Canceled => RESULT_CANCELED,
        OperationState::Retrying => RESULT_RETRYING,
    }
}

fn result_gauge(meter: &Meter, prefix: &str, name: &str, description: &'static str) -> Gauge<f64> {
    meter
        .f64_gauge(format!("{prefix}.{name}"))
        .with_description(description)
        .build()
}

pub struct OperationResultCollector {
    provisioning: Gauge<f64>,
    deprovisioning: Gauge<f64>,
    update: Gauge<f64>,
    upgrade_kyma: Gauge<f64>,
    upgrade_cluster: Gauge<f64>,
    /// Last recorded value per in-flight operation id
    last_results: DashMap<String, f64>,
    finished: Mutex<VecDeque<(String, f64)>>,
    history: usize,
}

impl OperationResultCollector {
    pub fn new(meter: &Meter, prefix: &str) -> Self {
        Self {
            provisioning: result_gauge(meter, prefix, "provisioning_result", "Result of the provisioning"),
            deprovisioning: result_gauge(
                meter,
                prefix,
                "deprovisioning_result",
                "Result of the deprovisioning",
            ),
            update: result_gauge(meter, prefix, "update_result", "Result of the update"),
            upgrade_kyma: result_gauge(meter, prefix, "upgrade_kyma_result", "Result of the kyma upgrade"),
            upgrade_cluster: result_gauge(
                meter,
                prefix,
                "upgrade_cluster_result",
                "Result of the cluster upgrade",
            ),
            last_results: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            history: DEFAULT_RESULT_HISTORY,
        }
    }

    /// Keep at most `history` finished operations queryable
    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history;
        self
    }

    /// Last value recorded for `operation_id`, if it is in flight or recently finished
    pub fn last_result(&self, operation_id: &str) -> Option<f64> {
        if let Some(value) = self.last_results.get(operation_id) {
            return Some(*value);
        }
        self.finished
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == operation_id)
            .map(|(_, value)| *value)
    }

    /// Number of operations the collector currently remembers
    pub fn tracked_operations(&self) -> usize {
        self.last_results.len() + self.finished.lock().len()
    }

    fn remember(&self, snapshot: &OperationSnapshot, value: f64) {
        if !snapshot.state.is_terminal() {
            self.last_results.insert(snapshot.operation_id.clone(), value);
            return;
        }

        self.last_results.remove(&snapshot.operation_id);
        if self.history == 0 {
            return;
        }
        let mut finished = self.finished.lock();
        finished.retain(|(id, _)| id != &snapshot.operation_id);
        while finished.len() >= self.history {
            finished.pop_front();
        }
        finished.push_back((snapshot.operation_id.clone(), value));
    }

    fn gauge_for(&self, operation_type: OperationType) -> &Gauge<f64> {
        match operation_type {
            OperationType::Provision => &self.provisioning,
            OperationType::Deprovision => &self.deprovisioning,
            OperationType::Update => &self.update,
            OperationType::UpgradeKyma => &self.upgrade_kyma,
            OperationType::UpgradeCluster => &self.upgrade_cluster,
        }
    }

    fn record(&self, snapshot: &OperationSnapshot, value: f64, error_labels: (&str, &str)) {
        let mut labels = vec![
            KeyValue::new("operation_id", snapshot.operation_id.clone()),
            KeyValue::new("instance_id", snapshot.instance_id.clone()),
            KeyValue::new("global_account_id", snapshot.global_account_id.clone()),
            KeyValue::new("plan_id", snapshot.plan_id.clone()),
        ];
        if matches!(
            snapshot.operation_type,
            OperationType::Provision | OperationType::Deprovision
        ) {
            labels.push(KeyValue::new("error_category", error_labels.0.to_string()));
            labels.push(KeyValue::new("error_reason", error_labels.1.to_string()));
        }

        self.gauge_for(snapshot.operation_type).record(value, &labels);
        self.remember(snapshot, value);
        trace!(
            operation_id = %snapshot.operation_id,
            operation_type = %snapshot.operation_type,
            value,
            "Recorded operation result"
        );
    }

    fn on_step_processed(
        &self,
        expected: OperationType,
        event: &LifecycleEvent,
        processed: &StepProcessed,
    ) -> Result<(), EventError> {
        if processed.operation.operation_type != expected {
            return Err(EventError::UnexpectedEvent {
                handler: self.name().to_string(),
                event: format!(
                    "{} for a {} operation",
                    event.name(),
                    processed.operation.operation_type
                ),
            });
        }

        self.record(
            &processed.operation,
            result_value(processed.operation.state),
            (
                processed.error_component_label(),
                processed.error_reason_label(),
            ),
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler for OperationResultCollector {
    fn name(&self) -> &str {
        "operation_result_collector"
    }

    async fn handle(&self, event: &LifecycleEvent) -> Result<(), EventError> {
        match event {
            LifecycleEvent::ProvisioningStepProcessed(e) => {
                self.on_step_processed(OperationType::Provision, event, e)
            }
            LifecycleEvent::DeprovisioningStepProcessed(e) => {
                self.on_step_processed(OperationType::Deprovision, event, e)
            }
            LifecycleEvent::UpdateStepProcessed(e) => {
                self.on_step_processed(OperationType::Update, event, e)
            }
            LifecycleEvent::UpgradeKymaStepProcessed(e) => {
                self.on_step_processed(OperationType::UpgradeKyma, event, e)
            }
            LifecycleEvent::UpgradeClusterStepProcessed(e) => {
                self.on_step_processed(OperationType::UpgradeCluster, event, e)
            }
            LifecycleEvent::OperationSucceeded(snapshot) => {
                self.record(snapshot, RESULT_SUCCEEDED, ("", ""));
                Ok(())
            }
            LifecycleEvent::CancellationRequested(snapshot) => {
                self.record(snapshot, RESULT_CANCELING, ("", ""));
                Ok(())
            }
            LifecycleEvent::OperationCanceled(snapshot) => {
                self.record(snapshot, RESULT_CANCELED, ("", ""));
                Ok(())
            }
        }
    }
}
