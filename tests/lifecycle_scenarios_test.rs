//! End-to-end runs of the built-in steps through the scheduler.

mod common;

use common::*;
use runtime_lifecycle::clients::RuntimeOperationState;
use runtime_lifecycle::models::{Operation, OperationType};
use runtime_lifecycle::orchestration::{ErrComponent, ErrReason, ProcessOutcome, Scheduler};
use runtime_lifecycle::state_machine::OperationState;
use runtime_lifecycle::steps::{
    default_pipelines, deprovisioning_pipeline, Collaborators, TriggerKymaUninstallStep,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct World {
    harness: Harness,
    provisioner: Arc<FakeProvisioner>,
    shoots: Arc<FakeShoots>,
    installer: Arc<FakeInstaller>,
    scheduler: Scheduler,
}

fn world(
    provisioner_state: RuntimeOperationState,
    provisioner_message: Option<&str>,
    kubeconfig: Option<&str>,
    shoots: FakeShoots,
    installer: FakeInstaller,
) -> World {
    let harness = Harness::new();
    let provisioner = FakeProvisioner::with_state(provisioner_state, provisioner_message);
    let shoots = Arc::new(shoots);
    let installer = Arc::new(installer);
    let collaborators = Collaborators {
        provisioner: provisioner.clone(),
        clusters: Arc::new(FakeClusters {
            kubeconfig: kubeconfig.map(str::to_string),
        }),
        shoots: shoots.clone(),
        installation: installer.clone(),
    };
    let pipelines =
        default_pipelines(harness.manager.clone(), &collaborators, &harness.config.timeouts)
            .unwrap();
    let scheduler = harness.scheduler(pipelines);

    World {
        harness,
        provisioner,
        shoots,
        installer,
        scheduler,
    }
}

fn provisioner_world(state: RuntimeOperationState, message: Option<&str>) -> World {
    world(state, message, None, FakeShoots::default(), FakeInstaller::default())
}

fn update_operation(runtime_id: &str) -> Operation {
    let mut op = operation(OperationType::Update);
    op.runtime_id = Some(runtime_id.to_string());
    op.provisioner_operation_id = Some("prov-op-1".to_string());
    op
}

async fn run(world: &World, op: Operation) -> (ProcessOutcome, Operation) {
    let op = world.scheduler.enqueue(op).await.unwrap();
    let outcome = world
        .scheduler
        .process(world.harness.stored(op.id()).await)
        .await
        .unwrap();
    (outcome, world.harness.stored(op.id()).await)
}

#[tokio::test]
async fn test_status_check_with_empty_runtime_id_fails() {
    let world = provisioner_world(RuntimeOperationState::Succeeded, None);

    let (outcome, stored) = run(&world, update_operation("")).await;

    assert_eq!(outcome, ProcessOutcome::Done);
    assert_eq!(stored.state, OperationState::Failed);
    assert_eq!(stored.description, "Runtime ID is empty");
    assert_eq!(world.provisioner.status_calls(), 0);
}

#[tokio::test]
async fn test_status_check_in_progress_polls_again() {
    let world = provisioner_world(RuntimeOperationState::InProgress, None);

    let (outcome, stored) = run(&world, update_operation("rt-1")).await;

    assert_eq!(outcome, ProcessOutcome::Requeue(Duration::from_secs(60)));
    assert_eq!(stored.state, OperationState::InProgress);
    assert!(stored.last_error.is_none());
    assert_eq!(world.provisioner.status_calls(), 1);
}

#[tokio::test]
async fn test_status_check_succeeded_completes_update() {
    let world = provisioner_world(RuntimeOperationState::Succeeded, None);

    let (outcome, stored) = run(&world, update_operation("rt-1")).await;

    assert_eq!(outcome, ProcessOutcome::Done);
    assert_eq!(stored.state, OperationState::Succeeded);
    assert_eq!(
        world.harness.sink.names(),
        vec!["update_step_processed", "operation_succeeded"]
    );
}

#[tokio::test]
async fn test_status_check_failed_fails_with_provisioner_message() {
    let world = provisioner_world(RuntimeOperationState::Failed, Some("boom"));

    let (outcome, stored) = run(&world, update_operation("rt-1")).await;

    assert_eq!(outcome, ProcessOutcome::Done);
    assert_eq!(stored.state, OperationState::Failed);
    assert!(stored.description.contains("boom"));
    assert!(stored.last_error.unwrap().message.contains("boom"));
}

#[tokio::test]
async fn test_provisioning_creates_runtime_then_polls() {
    let world = provisioner_world(RuntimeOperationState::InProgress, None);

    let (outcome, stored) = run(&world, operation(OperationType::Provision)).await;

    // Entering the check stage waits one poll interval
    assert_eq!(outcome, ProcessOutcome::Requeue(Duration::from_secs(60)));
    assert_eq!(stored.provisioner_operation_id(), Some("prov-op-1"));
    assert_eq!(stored.runtime_id(), Some("rt-1"));
    assert_eq!(world.provisioner.status_calls(), 0);

    world.provisioner.set_state(RuntimeOperationState::Succeeded);
    let outcome = world.scheduler.process(stored.clone()).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Done);
    assert_eq!(world.harness.stored(stored.id()).await.state, OperationState::Succeeded);
    assert_eq!(world.provisioner.requests.lock().len(), 1);
    assert_eq!(world.provisioner.status_calls(), 1);
}

#[tokio::test]
async fn test_deprovisioning_without_kubeconfig_skips_uninstall() {
    let world = world(
        RuntimeOperationState::Succeeded,
        None,
        None,
        FakeShoots::default(),
        FakeInstaller::default(),
    );
    let mut op = operation(OperationType::Deprovision);
    op.runtime_id = Some("rt-1".to_string());

    let (outcome, stored) = run(&world, op).await;

    assert_eq!(outcome, ProcessOutcome::Done);
    assert_eq!(stored.state, OperationState::Succeeded);
    assert_eq!(world.shoots.calls.load(Ordering::SeqCst), 0);
    assert_eq!(world.installer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_deprovisioning_shoot_lookup_failure_is_retried() {
    let world = world(
        RuntimeOperationState::Succeeded,
        None,
        Some(KUBECONFIG),
        FakeShoots {
            fail: true,
            ..Default::default()
        },
        FakeInstaller::default(),
    );
    let mut op = operation(OperationType::Deprovision);
    op.runtime_id = Some("rt-1".to_string());

    let (outcome, stored) = run(&world, op).await;

    assert!(matches!(outcome, ProcessOutcome::Requeue(_)));
    assert_eq!(stored.state, OperationState::Retrying);
    let last_error = stored.last_error.unwrap();
    assert_eq!(last_error.component, Some(ErrComponent::ClusterClient));
    assert_eq!(last_error.component_label(), "gardener");
}

#[tokio::test]
async fn test_deprovisioning_invalid_kubeconfig_fails() {
    let world = world(
        RuntimeOperationState::Succeeded,
        None,
        Some("invalid"),
        FakeShoots::default(),
        FakeInstaller::default(),
    );
    let mut op = operation(OperationType::Deprovision);
    op.runtime_id = Some("rt-1".to_string());

    let (outcome, stored) = run(&world, op).await;

    assert_eq!(outcome, ProcessOutcome::Done);
    assert_eq!(stored.state, OperationState::Failed);
    let last_error = stored.last_error.unwrap();
    assert_eq!(last_error.component, Some(ErrComponent::ClusterK8sClient));
    assert_eq!(last_error.reason, Some(ErrReason::InvalidConfig));
    assert_eq!(world.installer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_deprovisioning_triggers_uninstall() {
    let world = world(
        RuntimeOperationState::Succeeded,
        None,
        Some(KUBECONFIG),
        FakeShoots::default(),
        FakeInstaller::default(),
    );
    let mut op = operation(OperationType::Deprovision);
    op.runtime_id = Some("rt-1".to_string());

    let (outcome, stored) = run(&world, op).await;

    assert_eq!(outcome, ProcessOutcome::Done);
    assert_eq!(stored.state, OperationState::Succeeded);
    assert_eq!(world.installer.calls.load(Ordering::SeqCst), 1);
}

const UNINSTALL_DELAY: Duration = Duration::from_secs(300);

struct Teardown {
    harness: Harness,
    shoots: Arc<FakeShoots>,
    installer: Arc<FakeInstaller>,
    followup: Arc<ScriptedStep>,
    scheduler: Scheduler,
}

fn teardown(kubeconfig: Option<&str>) -> Teardown {
    let harness = Harness::new();
    let shoots = Arc::new(FakeShoots::default());
    let installer = Arc::new(FakeInstaller::default());
    let uninstall = Arc::new(TriggerKymaUninstallStep::new(
        Arc::new(FakeClusters {
            kubeconfig: kubeconfig.map(str::to_string),
        }),
        shoots.clone(),
        installer.clone(),
        Duration::from_secs(600),
        UNINSTALL_DELAY,
    ));
    let followup = ScriptedStep::new("Deprovision_Cluster");
    let pipeline = deprovisioning_pipeline(uninstall, as_steps(&[&followup])).unwrap();
    let scheduler = harness.scheduler(vec![pipeline]);

    Teardown {
        harness,
        shoots,
        installer,
        followup,
        scheduler,
    }
}

async fn run_teardown(teardown: &Teardown) -> (ProcessOutcome, Operation) {
    let mut op = operation(OperationType::Deprovision);
    op.runtime_id = Some("rt-1".to_string());
    let op = teardown.scheduler.enqueue(op).await.unwrap();
    let outcome = teardown
        .scheduler
        .process(teardown.harness.stored(op.id()).await)
        .await
        .unwrap();
    (outcome, teardown.harness.stored(op.id()).await)
}

#[tokio::test]
async fn test_skipped_uninstall_runs_followups_without_delay() {
    let teardown = teardown(None);

    let (outcome, stored) = run_teardown(&teardown).await;

    assert_eq!(outcome, ProcessOutcome::Done);
    assert_eq!(stored.state, OperationState::Succeeded);
    assert_eq!(teardown.followup.calls(), 1);
    assert_eq!(teardown.shoots.calls.load(Ordering::SeqCst), 0);
    assert_eq!(teardown.installer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_triggered_uninstall_delays_followups() {
    let teardown = teardown(Some(KUBECONFIG));

    let (outcome, stored) = run_teardown(&teardown).await;

    assert_eq!(outcome, ProcessOutcome::Requeue(UNINSTALL_DELAY));
    assert_eq!(stored.state, OperationState::InProgress);
    assert_eq!(teardown.installer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(teardown.followup.calls(), 0);

    let outcome = teardown.scheduler.process(stored).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Done);
    assert_eq!(teardown.followup.calls(), 1);
    assert_eq!(teardown.installer.calls.load(Ordering::SeqCst), 1);
}
