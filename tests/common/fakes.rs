//! Hand-written fakes for steps, the event sink and external collaborators.

use async_trait::async_trait;
use parking_lot::Mutex;
use runtime_lifecycle::clients::{
    ClientError, ClientResult, Cluster, ClusterRepository, InstallationService, KubeConfig,
    ProvisionRuntimeInput, ProvisionRuntimeResponse, ProvisionerClient, RuntimeOperationState,
    RuntimeOperationStatus, Shoot, ShootClient,
};
use runtime_lifecycle::events::{EventError, EventSink, LifecycleEvent};
use runtime_lifecycle::models::Operation;
use runtime_lifecycle::orchestration::{ClassifiedError, ErrComponent, Step, StepResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const KUBECONFIG: &str = r#"apiVersion: v1
clusters:
- cluster:
    server: https://192.168.64.4:8443
  name: minikube
contexts:
- context:
    cluster: minikube
    user: minikube
  name: minikube
current-context: minikube
kind: Config
users:
- name: minikube
  user:
    token: fake
"#;

/// Collects every published event
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(LifecycleEvent::name).collect()
    }

    pub fn steps(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| e.step_processed_payload().map(|p| p.step_name.clone()))
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Rejects every event
pub struct FailingSink;

#[async_trait]
impl EventSink for FailingSink {
    async fn publish(&self, event: LifecycleEvent) -> Result<(), EventError> {
        Err(EventError::Handler {
            handler: "failing".to_string(),
            message: format!("cannot deliver {}", event.name()),
        })
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    Advance,
    Requeue(Duration),
    Recoverable(&'static str),
    Fatal(&'static str),
    Panic(&'static str),
}

/// Step that plays back a script, then repeats its default action
pub struct ScriptedStep {
    name: String,
    script: Mutex<VecDeque<Action>>,
    default: Action,
    calls: AtomicUsize,
}

impl ScriptedStep {
    pub fn new(name: &str) -> Arc<Self> {
        Self::scripted(name, Vec::new(), Action::Advance)
    }

    pub fn scripted(name: &str, script: Vec<Action>, default: Action) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            default,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, operation: Operation) -> StepResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let action = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        match action {
            Action::Advance => StepResult::advance(operation),
            Action::Requeue(delay) => StepResult::requeue(operation, delay),
            Action::Recoverable(message) => StepResult::error(
                operation,
                ClassifiedError::new(message).with_component(ErrComponent::Provisioner),
            ),
            Action::Fatal(message) => StepResult::error(
                operation,
                ClassifiedError::fatal(message).with_component(ErrComponent::InternalValidation),
            ),
            Action::Panic(message) => panic!("{}", message),
        }
    }
}

pub fn as_steps(steps: &[&Arc<ScriptedStep>]) -> Vec<Arc<dyn Step>> {
    steps
        .iter()
        .map(|&step| step.clone() as Arc<dyn Step>)
        .collect()
}

/// Provisioner returning a fixed status and accepting every runtime request
pub struct FakeProvisioner {
    pub status: Mutex<ClientResult<RuntimeOperationStatus>>,
    pub status_calls: AtomicUsize,
    pub requests: Mutex<Vec<ProvisionRuntimeInput>>,
}

impl FakeProvisioner {
    pub fn with_state(state: RuntimeOperationState, message: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(Ok(RuntimeOperationStatus {
                state,
                message: message.map(str::to_string),
            })),
            status_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: RuntimeOperationState) {
        *self.status.lock() = Ok(RuntimeOperationStatus {
            state,
            message: None,
        });
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProvisionerClient for FakeProvisioner {
    async fn provision_runtime(
        &self,
        _global_account_id: &str,
        _subaccount_id: &str,
        input: ProvisionRuntimeInput,
    ) -> ClientResult<ProvisionRuntimeResponse> {
        let mut requests = self.requests.lock();
        requests.push(input);
        Ok(ProvisionRuntimeResponse {
            operation_id: format!("prov-op-{}", requests.len()),
            runtime_id: "rt-1".to_string(),
        })
    }

    async fn runtime_operation_status(
        &self,
        _global_account_id: &str,
        _operation_id: &str,
    ) -> ClientResult<RuntimeOperationStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        match &*self.status.lock() {
            Ok(status) => Ok(status.clone()),
            Err(err) => Err(ClientError::Transport(err.to_string())),
        }
    }
}

pub struct FakeClusters {
    pub kubeconfig: Option<String>,
}

#[async_trait]
impl ClusterRepository for FakeClusters {
    async fn get_cluster(&self, runtime_id: &str) -> ClientResult<Cluster> {
        Ok(Cluster {
            runtime_id: runtime_id.to_string(),
            name: "my cluster".to_string(),
            kubeconfig: self.kubeconfig.clone(),
        })
    }
}

#[derive(Default)]
pub struct FakeShoots {
    pub fail: bool,
    pub hibernated: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ShootClient for FakeShoots {
    async fn get_shoot(&self, name: &str) -> ClientResult<Shoot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ClientError::Transport("some error".to_string()));
        }
        Ok(Shoot {
            name: name.to_string(),
            hibernated: self.hibernated,
        })
    }
}

#[derive(Default)]
pub struct FakeInstaller {
    pub fail: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl InstallationService for FakeInstaller {
    async fn trigger_uninstall(&self, _kubeconfig: &KubeConfig) -> ClientResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ClientError::Transport("some error".to_string()));
        }
        Ok(())
    }
}
