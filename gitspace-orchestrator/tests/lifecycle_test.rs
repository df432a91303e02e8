//! End-to-end lifecycle tests: requests go through the service, events
//! through the bus, and the orchestrator drives the in-memory backends.

use std::time::Duration;

use gitspace_core::{ErrorKind, GitspaceError};
use gitspace_orchestrator::test_utils::{create_request, HarnessOptions, TestHarness};
use gitspace_orchestrator::{
    spawn_consumers, store, EventBus, EventCategory, HistoryKind, IdeType, InfraCallbackRequest,
    InstanceState, LifecycleStage, ProvisioningStatus, UpdateConfigRequest,
};
use gitspace_provider::mock::FakeContainerOrchestrator;
use gitspace_provider::RunArgResolver;

async fn history_kinds(harness: &TestHarness, id: &str) -> Vec<HistoryKind> {
    harness
        .service
        .list_events(id)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.kind)
        .collect()
}

async fn pending_handle(harness: &TestHarness, id: &str) -> String {
    harness
        .orchestrator
        .infra()
        .record(id)
        .await
        .unwrap()
        .and_then(|record| record.resource_handle)
        .expect("pending allocation")
}

fn ready_callback(id: &str, handle: &str, host: &str) -> InfraCallbackRequest {
    InfraCallbackRequest {
        config_id: id.to_string(),
        handle: Some(handle.to_string()),
        error: None,
        host: Some(host.to_string()),
        data: serde_json::json!({"zone": "eu-1"}),
    }
}

fn failed_callback(id: &str, handle: &str, error: &str) -> InfraCallbackRequest {
    InfraCallbackRequest {
        config_id: id.to_string(),
        handle: Some(handle.to_string()),
        error: Some(error.to_string()),
        host: None,
        data: serde_json::Value::Null,
    }
}

async fn remote_config(harness: &TestHarness, id: &str) {
    let mut request = create_request(id, IdeType::VsCodeWeb);
    request.infra_resource_ref = "remote".to_string();
    harness.service.create_config(request).await.unwrap();
}

async fn running(harness: &TestHarness, id: &str) {
    harness.service.request_start(id).await.unwrap();
    harness.drain().await;
    assert_eq!(harness.instance(id).await.state, InstanceState::Running);
}

#[tokio::test]
async fn test_browser_ide_start_stop_delete() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;

    let status = harness.service.request_start("c1").await.unwrap();
    assert_eq!(status.state, InstanceState::Provisioning);
    harness.drain().await;

    let instance = harness.instance("c1").await;
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.stage, Some(LifecycleStage::Finalize));
    assert!(instance.started_at.is_some());
    assert!(instance.pending_event_id.is_none());

    let token = instance.access_token.clone().unwrap();
    let uri = instance.connection_uri.clone().unwrap();
    assert!(uri.starts_with(&format!(
        "http://localhost:{}/",
        FakeContainerOrchestrator::host_port_for(8089)
    )));
    assert!(uri.contains(&format!("tkn={}", token)));

    // clone, then IDE bootstrap with the token in its environment
    let execs = harness.containers.execs();
    assert_eq!(execs.len(), 2);
    assert_eq!(
        execs[1].env.get("GITSPACE_ACCESS_TOKEN"),
        Some(&token)
    );
    assert!(harness.docker.is_provisioned("c1"));

    harness.service.request_stop("c1").await.unwrap();
    harness.drain().await;
    let instance = harness.instance("c1").await;
    assert_eq!(instance.state, InstanceState::Stopped);
    assert!(instance.stopped_at.is_some());
    assert!(!harness
        .containers
        .is_running(&RunArgResolver::container_name("c1")));

    harness.service.request_delete("c1").await.unwrap();
    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Deleted);
    assert!(harness.orchestrator.infra().record("c1").await.unwrap().is_none());
    assert_eq!(harness.docker.live_count(), 0);
    assert_eq!(harness.containers.container_count(), 0);

    let err = harness.service.get_config("c1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let kinds = history_kinds(&harness, "c1").await;
    for expected in [
        HistoryKind::ConfigCreated,
        HistoryKind::StartRequested,
        HistoryKind::InfraProvisioned,
        HistoryKind::ContainerStarted,
        HistoryKind::IdeConfigured,
        HistoryKind::Running,
        HistoryKind::StopRequested,
        HistoryKind::Stopped,
        HistoryKind::DeleteRequested,
        HistoryKind::InfraDeprovisioned,
        HistoryKind::Deleted,
        HistoryKind::OperationCompleted,
    ] {
        assert!(kinds.contains(&expected), "missing {:?}", expected);
    }
}

#[tokio::test]
async fn test_double_start_is_rejected() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;

    harness.service.request_start("c1").await.unwrap();
    let err = harness.service.request_start("c1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Running);
    assert_eq!(harness.containers.creations(), 1);
    assert_eq!(
        store::count_active_instances(&harness.pool, "c1").await.unwrap(),
        1
    );

    // starting a running gitspace is a no-op
    let status = harness.service.request_start("c1").await.unwrap();
    assert_eq!(status.state, InstanceState::Running);
    assert_eq!(harness.drain().await, 0);
}

#[tokio::test]
async fn test_stop_twice_is_idempotent() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    running(&harness, "c1").await;

    let first = harness.service.request_stop("c1").await.unwrap();
    assert_eq!(first.state, InstanceState::Stopping);
    let second = harness.service.request_stop("c1").await.unwrap();
    assert_eq!(second.state, InstanceState::Stopping);
    assert_eq!(harness.bus.depth(EventCategory::Action).await.unwrap(), 1);

    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Stopped);
    assert_eq!(harness.containers.stops(), 1);

    let third = harness.service.request_stop("c1").await.unwrap();
    assert_eq!(third.state, InstanceState::Stopped);
    assert_eq!(harness.drain().await, 0);
}

#[tokio::test]
async fn test_stop_in_error_is_rejected() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    harness
        .containers
        .fail_next_start(GitspaceError::RuntimeFault("entrypoint crashed".into()));

    harness.service.request_start("c1").await.unwrap();
    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Error);

    let err = harness.service.request_stop("c1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_stopped_gitspace_restarts_as_new_instance() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    running(&harness, "c1").await;
    let first = harness.instance("c1").await.identifier;

    harness.service.request_stop("c1").await.unwrap();
    harness.drain().await;
    running(&harness, "c1").await;

    let second = harness.instance("c1").await;
    assert_ne!(second.identifier, first);
    // the infrastructure outlives a stop and is reused
    assert_eq!(harness.docker.provision_calls(), 1);
    assert_eq!(
        store::count_active_instances(&harness.pool, "c1").await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_delete_releases_everything() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    running(&harness, "c1").await;

    harness.service.request_delete("c1").await.unwrap();
    // a second delete while the first is in flight changes nothing
    let status = harness.service.request_delete("c1").await.unwrap();
    assert_eq!(status.state, InstanceState::Deleting);
    harness.drain().await;

    assert_eq!(harness.instance("c1").await.state, InstanceState::Deleted);
    assert!(harness.orchestrator.infra().record("c1").await.unwrap().is_none());
    assert_eq!(harness.docker.live_count(), 0);
    assert_eq!(harness.docker.deprovision_calls(), 1);
    assert_eq!(harness.containers.container_count(), 0);

    let status = harness.service.request_delete("c1").await.unwrap();
    assert_eq!(status.state, InstanceState::Deleted);
    assert_eq!(harness.drain().await, 0);
}

#[tokio::test]
async fn test_delete_from_error() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    harness
        .containers
        .fail_next_start(GitspaceError::RuntimeFault("entrypoint crashed".into()));
    harness.service.request_start("c1").await.unwrap();
    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Error);

    harness.service.request_delete("c1").await.unwrap();
    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Deleted);
    assert_eq!(harness.docker.live_count(), 0);
}

#[tokio::test]
async fn test_delete_never_started() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;

    harness.service.request_delete("c1").await.unwrap();
    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Deleted);
    assert_eq!(harness.docker.deprovision_calls(), 0);
}

#[tokio::test]
async fn test_redelivered_event_has_no_effect() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    harness.service.request_start("c1").await.unwrap();

    let delivery = harness
        .bus
        .receive(EventCategory::Action)
        .await
        .unwrap()
        .unwrap();
    harness.orchestrator.handle(&delivery.event).await.unwrap();
    harness.orchestrator.handle(&delivery.event).await.unwrap();
    harness.bus.ack(&delivery).await.unwrap();

    assert_eq!(harness.instance("c1").await.state, InstanceState::Running);
    assert_eq!(harness.containers.start_calls(), 1);
    assert_eq!(harness.containers.creations(), 1);
    assert_eq!(harness.docker.provision_calls(), 1);

    // a stale start arriving after a stop does not revive the gitspace
    harness.service.request_stop("c1").await.unwrap();
    harness.drain().await;
    harness.orchestrator.handle(&delivery.event).await.unwrap();
    assert_eq!(harness.instance("c1").await.state, InstanceState::Stopped);
}

#[tokio::test]
async fn test_transient_image_pull_failure_is_retried() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    for _ in 0..2 {
        harness
            .containers
            .fail_next_start(GitspaceError::ImagePullFailure("registry hiccup".into()));
    }

    running(&harness, "c1").await;
    assert_eq!(harness.containers.start_calls(), 3);
    assert_eq!(harness.containers.creations(), 1);
}

#[tokio::test]
async fn test_runtime_fault_is_not_retried() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    harness
        .containers
        .fail_next_start(GitspaceError::RuntimeFault("entrypoint crashed".into()));

    harness.service.request_start("c1").await.unwrap();
    harness.drain().await;

    let instance = harness.instance("c1").await;
    assert_eq!(instance.state, InstanceState::Error);
    assert_eq!(instance.failed_stage, Some(LifecycleStage::StartContainer));
    assert_eq!(instance.error_kind, Some(ErrorKind::RuntimeFault));
    assert!(instance.error_message.is_some());
    assert_eq!(harness.containers.start_calls(), 1);
    assert!(history_kinds(&harness, "c1")
        .await
        .contains(&HistoryKind::Error));
}

#[tokio::test]
async fn test_resume_after_error_reuses_infrastructure() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    for _ in 0..3 {
        harness
            .containers
            .fail_next_start(GitspaceError::ImagePullFailure("not found".into()));
    }

    harness.service.request_start("c1").await.unwrap();
    harness.drain().await;
    let failed = harness.instance("c1").await;
    assert_eq!(failed.state, InstanceState::Error);
    assert_eq!(failed.error_kind, Some(ErrorKind::ImagePullFailure));

    running(&harness, "c1").await;
    let resumed = harness.instance("c1").await;
    assert_eq!(resumed.identifier, failed.identifier);
    assert!(resumed.failed_stage.is_none());
    assert!(resumed.error_kind.is_none());
    assert_eq!(harness.docker.provision_calls(), 1);
    assert_eq!(harness.containers.creations(), 1);
}

#[tokio::test]
async fn test_resume_after_runtime_fault_replaces_container() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    // the clone script is the first thing executed in a new container
    harness
        .containers
        .fail_next_exec(GitspaceError::RuntimeFault("git exited with 128".into()));

    harness.service.request_start("c1").await.unwrap();
    harness.drain().await;
    let failed = harness.instance("c1").await;
    assert_eq!(failed.state, InstanceState::Error);
    assert_eq!(failed.failed_stage, Some(LifecycleStage::StartContainer));

    running(&harness, "c1").await;
    assert_eq!(harness.containers.removes(), 1);
    assert_eq!(harness.containers.creations(), 2);
    assert_eq!(harness.docker.provision_calls(), 1);
}

#[tokio::test]
async fn test_container_start_deadline() {
    let mut options = HarnessOptions::default();
    options.containers = FakeContainerOrchestrator::new().with_start_delay(Duration::from_secs(3));
    options.orchestrator.container_start_deadline_secs = 1;
    let harness = TestHarness::with_options(options).await;
    harness.create("c1", IdeType::VsCodeWeb).await;

    harness.service.request_start("c1").await.unwrap();
    harness.drain().await;

    let instance = harness.instance("c1").await;
    assert_eq!(instance.state, InstanceState::Error);
    assert_eq!(instance.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(instance.failed_stage, Some(LifecycleStage::StartContainer));
    assert_eq!(harness.containers.container_count(), 0);
}

#[tokio::test]
async fn test_held_lock_yields_conflict() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;

    let guard = harness.locks.acquire("c1").await.unwrap();
    let err = harness.service.request_start("c1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    drop(guard);

    harness.service.request_start("c1").await.unwrap();

    // the consumer cannot take the lock either; the event comes back later
    let guard = harness.locks.acquire("c1").await.unwrap();
    let consumer = harness.consumer(EventCategory::Action);
    assert!(consumer.process_next().await.unwrap());
    assert_eq!(harness.instance("c1").await.state, InstanceState::Provisioning);
    drop(guard);

    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Running);
}

#[tokio::test]
async fn test_poison_event_is_dropped() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    harness.service.request_start("c1").await.unwrap();

    let consumer = harness.consumer(EventCategory::Action);
    let guard = harness.locks.acquire("c1").await.unwrap();
    for _ in 0..harness.events.max_deliveries {
        assert!(consumer.process_next().await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    drop(guard);

    assert!(consumer.process_next().await.unwrap());
    assert_eq!(harness.bus.depth(EventCategory::Action).await.unwrap(), 0);

    let instance = harness.instance("c1").await;
    assert_eq!(instance.state, InstanceState::Error);
    assert_eq!(instance.error_kind, Some(ErrorKind::Internal));
    assert!(history_kinds(&harness, "c1")
        .await
        .contains(&HistoryKind::EventDropped));

    // the gitspace is recoverable
    running(&harness, "c1").await;
}

#[tokio::test]
async fn test_asynchronous_provider_callback() {
    let harness = TestHarness::new().await;
    remote_config(&harness, "c1").await;

    harness.service.request_start("c1").await.unwrap();
    harness.drain().await;

    let waiting = harness.instance("c1").await;
    assert_eq!(waiting.state, InstanceState::Provisioning);
    assert!(history_kinds(&harness, "c1")
        .await
        .contains(&HistoryKind::InfraProvisioningPending));
    assert_eq!(harness.containers.start_calls(), 0);

    let handle = pending_handle(&harness, "c1").await;
    let callback = ready_callback("c1", &handle, "10.0.0.5");
    harness.service.infra_callback(callback.clone()).await.unwrap();
    harness.drain().await;

    let instance = harness.instance("c1").await;
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.host.as_deref(), Some("10.0.0.5"));
    assert!(instance.connection_uri.unwrap().contains("10.0.0.5"));
    let record = harness.orchestrator.infra().record("c1").await.unwrap().unwrap();
    assert_eq!(record.resource_handle.as_deref(), Some(handle.as_str()));

    // a duplicate callback changes nothing
    harness.service.infra_callback(callback).await.unwrap();
    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Running);
    assert_eq!(harness.containers.creations(), 1);
    assert_eq!(harness.generic.provision_calls(), 1);
}

#[tokio::test]
async fn test_asynchronous_provider_failure() {
    let harness = TestHarness::new().await;
    remote_config(&harness, "c1").await;

    harness.service.request_start("c1").await.unwrap();
    harness.drain().await;

    let handle = pending_handle(&harness, "c1").await;
    harness
        .service
        .infra_callback(failed_callback("c1", &handle, "quota exceeded"))
        .await
        .unwrap();
    harness.drain().await;

    let instance = harness.instance("c1").await;
    assert_eq!(instance.state, InstanceState::Error);
    assert_eq!(instance.failed_stage, Some(LifecycleStage::ProvisionInfra));
    assert_eq!(instance.error_kind, Some(ErrorKind::ResourceUnavailable));
    assert!(instance.error_message.unwrap().contains("quota exceeded"));
}

#[tokio::test]
async fn test_earlier_attempt_failure_does_not_undo_restart() {
    let harness = TestHarness::new().await;
    remote_config(&harness, "c1").await;

    harness.service.request_start("c1").await.unwrap();
    harness.drain().await;
    let first = pending_handle(&harness, "c1").await;
    let failure = harness
        .service
        .infra_callback(failed_callback("c1", &first, "quota exceeded"))
        .await
        .unwrap();
    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Error);

    harness.service.request_start("c1").await.unwrap();
    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Provisioning);
    assert_eq!(harness.generic.provision_calls(), 2);
    // the failed allocation was released before asking again
    assert_eq!(harness.generic.deprovision_calls(), 1);
    let second = pending_handle(&harness, "c1").await;
    assert_ne!(first, second);

    // at-least-once delivery hands the old failure over again
    harness.orchestrator.handle(&failure).await.unwrap();
    assert_eq!(harness.instance("c1").await.state, InstanceState::Provisioning);
    let record = harness.orchestrator.infra().record("c1").await.unwrap().unwrap();
    assert_eq!(record.status, ProvisioningStatus::Pending);

    // and a late success for the old attempt is ignored too
    harness
        .service
        .infra_callback(ready_callback("c1", &first, "10.0.0.1"))
        .await
        .unwrap();
    harness.drain().await;
    assert_eq!(harness.instance("c1").await.state, InstanceState::Provisioning);
    let record = harness.orchestrator.infra().record("c1").await.unwrap().unwrap();
    assert_eq!(record.resource_handle.as_deref(), Some(second.as_str()));
    assert!(record.host.is_none());

    harness
        .service
        .infra_callback(ready_callback("c1", &second, "10.0.0.2"))
        .await
        .unwrap();
    harness.drain().await;
    let instance = harness.instance("c1").await;
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.host.as_deref(), Some("10.0.0.2"));
}

#[tokio::test]
async fn test_callback_requires_handle_and_host() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;

    let mut without_host = ready_callback("c1", "vm-7", "unused");
    without_host.host = None;
    let err = harness
        .service
        .infra_callback(without_host)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut without_handle = failed_callback("c1", "vm-7", "quota exceeded");
    without_handle.handle = None;
    let err = harness
        .service
        .infra_callback(without_handle)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_operation_result_recorded_once() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    harness.service.request_start("c1").await.unwrap();

    let action = harness.consumer(EventCategory::Action);
    while action.process_next().await.unwrap() {}
    assert_eq!(harness.instance("c1").await.state, InstanceState::Running);

    let delivery = harness
        .bus
        .receive(EventCategory::Operations)
        .await
        .unwrap()
        .expect("operation result queued");
    harness.orchestrator.handle(&delivery.event).await.unwrap();
    harness.orchestrator.handle(&delivery.event).await.unwrap();

    let recorded = history_kinds(&harness, "c1")
        .await
        .into_iter()
        .filter(|kind| *kind == HistoryKind::OperationCompleted)
        .count();
    assert_eq!(recorded, 1);
}

#[tokio::test]
async fn test_active_gitspaces_capped_per_owner() {
    let mut options = HarnessOptions::default();
    options.orchestrator.max_active_per_owner = Some(1);
    let harness = TestHarness::with_options(options).await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    harness.create("c2", IdeType::VsCodeWeb).await;
    let mut other_owner = create_request("c3", IdeType::VsCodeWeb);
    other_owner.owner = "bob".to_string();
    harness.service.create_config(other_owner).await.unwrap();

    running(&harness, "c1").await;

    let err = harness.service.request_start("c2").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert!(store::latest_instance(&harness.pool, "c2")
        .await
        .unwrap()
        .is_none());
    assert_eq!(harness.bus.depth(EventCategory::Action).await.unwrap(), 0);
    assert!(!history_kinds(&harness, "c2")
        .await
        .contains(&HistoryKind::StartRequested));

    // the cap is per owner, and a running gitspace is not blocked by itself
    running(&harness, "c3").await;
    harness.service.request_start("c1").await.unwrap();

    harness.service.request_stop("c1").await.unwrap();
    harness.drain().await;
    running(&harness, "c2").await;
}

#[tokio::test]
async fn test_changed_template_replaces_infrastructure() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    running(&harness, "c1").await;

    let change = UpdateConfigRequest {
        infra_resource_ref: Some("large".to_string()),
        ..Default::default()
    };
    let err = harness
        .service
        .update_config("c1", change.clone())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    harness.service.request_stop("c1").await.unwrap();
    harness.drain().await;
    let updated = harness.service.update_config("c1", change).await.unwrap();
    assert_eq!(updated.infra_resource_ref, "large");

    running(&harness, "c1").await;
    assert_eq!(harness.docker.provision_calls(), 2);
    assert_eq!(harness.docker.deprovision_calls(), 1);
    let record = harness.orchestrator.infra().record("c1").await.unwrap().unwrap();
    assert_eq!(record.template_id, "large");
}

#[tokio::test]
async fn test_logs_follow_latest_instance() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;
    assert!(harness.service.get_logs("c1", 50).await.unwrap().is_empty());

    running(&harness, "c1").await;
    let lines = harness.service.get_logs("c1", 50).await.unwrap();
    assert!(lines.iter().any(|l| l.line.contains("Gitspace is running")));

    let last = harness.service.get_logs("c1", 1).await.unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].line, lines[lines.len() - 1].line);
}

#[tokio::test]
async fn test_consumer_loops_until_shutdown() {
    let harness = TestHarness::new().await;
    harness.create("c1", IdeType::VsCodeWeb).await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = spawn_consumers(
        harness.bus.clone(),
        harness.orchestrator.clone(),
        &harness.events,
        shutdown_rx,
    );

    harness.service.request_start("c1").await.unwrap();
    let mut state = InstanceState::Provisioning;
    for _ in 0..200 {
        state = harness.instance("c1").await.state;
        if state == InstanceState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, InstanceState::Running);

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}
