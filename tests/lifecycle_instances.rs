//! Instance Lifecycle Integration Tests
//!
//! Provision, update and deprovision through the lifecycle handlers with a
//! running engine, plus alias and parent-alias bookkeeping.

mod common;

use serde_json::json;

use common::{next_event, provision_body, start_engine, Harness};
use osbroker::core::lifecycle::DeclaredIds;
use osbroker::core::{AsyncEngine, LifecycleError, Outcome, TaskOutcome};
use osbroker::domain::InstanceStatus;
use osbroker::services::fake::{FakeServiceManager, SERVICE_ID, STANDARD_PLAN_ID};
use osbroker::storage::Store;

fn last_state(outcome: Outcome) -> (String, String) {
    match outcome {
        Outcome::Ok(body) => (
            body["state"].as_str().unwrap_or_default().to_string(),
            body["description"].as_str().unwrap_or_default().to_string(),
        ),
        other => panic!("expected last operation body, got {:?}", other),
    }
}

#[tokio::test]
async fn test_provision_requires_accepts_incomplete() {
    let h = Harness::new();
    let err = h
        .lifecycle
        .provision("i-1", false, &provision_body(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::AsyncRequired));
    assert_eq!(err.status_code(), 422);
}

#[tokio::test]
async fn test_provision_runs_to_completion() {
    let h = Harness::new();
    let (mut events, cancel) = start_engine(&h);

    let outcome = h
        .lifecycle
        .provision("i-1", true, &provision_body(json!({ "someParameter": "x" })))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Accepted(json!({ "operation": "provisioning" })));

    let event = next_event(&mut events).await;
    assert_eq!(event.task.instance_id, "i-1");
    assert_eq!(event.outcome, TaskOutcome::Succeeded);

    let stored = h.store.get_instance("i-1").await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Provisioned);
    assert_eq!(
        stored.provisioning_parameters.get_string("someParameter"),
        Some("x".to_string())
    );

    let (state, _) = last_state(h.lifecycle.last_operation("i-1").await.unwrap());
    assert_eq!(state, "succeeded");
    cancel.cancel();
}

#[tokio::test]
async fn test_provision_replay_and_conflicts() {
    let h = Harness::new();
    let (mut events, cancel) = start_engine(&h);
    let request = provision_body(json!({ "someParameter": "x" }));

    h.lifecycle.provision("i-1", true, &request).await.unwrap();
    next_event(&mut events).await;

    // Identical request against a provisioned instance is a replay
    let replay = h.lifecycle.provision("i-1", true, &request).await.unwrap();
    assert_eq!(replay, Outcome::Ok(json!({})));

    let err = h
        .lifecycle
        .provision("i-1", true, &provision_body(json!({ "someParameter": "y" })))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Conflict(_)));
    cancel.cancel();
}

#[tokio::test]
async fn test_provision_replay_while_in_progress_conflicts() {
    let h = Harness::new();
    let request = provision_body(json!({}));

    // Engine not running, so the instance stays PROVISIONING
    h.lifecycle.provision("i-1", true, &request).await.unwrap();
    let err = h
        .lifecycle
        .provision("i-1", true, &request)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Conflict(_)));

    let (state, _) = last_state(h.lifecycle.last_operation("i-1").await.unwrap());
    assert_eq!(state, "in progress");
}

#[tokio::test]
async fn test_provision_rejects_bad_requests() {
    let h = Harness::new();

    let unknown_plan = h
        .lifecycle
        .provision(
            "i-1",
            true,
            &common::body(json!({ "service_id": SERVICE_ID, "plan_id": "nope" })),
        )
        .await
        .unwrap_err();
    assert!(matches!(unknown_plan, LifecycleError::BadRequest(_)));

    let malformed = h
        .lifecycle
        .provision("i-1", true, b"{not json")
        .await
        .unwrap_err();
    assert!(matches!(malformed, LifecycleError::MalformedRequest(_)));

    let invalid = h
        .lifecycle
        .provision("i-1", true, &provision_body(json!({ "size": 3 })))
        .await
        .unwrap_err();
    assert_eq!(invalid.status_code(), 400);

    assert!(h.store.get_instance("i-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_provision_failure_is_recorded() {
    let h = Harness::with_manager(
        FakeServiceManager::new().on_provision(|_| Err(anyhow::anyhow!("quota exceeded"))),
    );
    let (mut events, cancel) = start_engine(&h);

    h.lifecycle
        .provision("i-1", true, &provision_body(json!({})))
        .await
        .unwrap();
    let event = next_event(&mut events).await;
    assert!(matches!(event.outcome, TaskOutcome::Failed { .. }));

    let stored = h.store.get_instance("i-1").await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::ProvisioningFailed);

    let (state, description) = last_state(h.lifecycle.last_operation("i-1").await.unwrap());
    assert_eq!(state, "failed");
    assert_eq!(description, "run: quota exceeded");
    cancel.cancel();
}

#[tokio::test]
async fn test_alias_is_unique() {
    let h = Harness::new();

    h.lifecycle
        .provision("i-1", true, &provision_body(json!({ "alias": "db" })))
        .await
        .unwrap();
    let err = h
        .lifecycle
        .provision("i-2", true, &provision_body(json!({ "alias": "db" })))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Conflict(_)));

    let holder = h.store.get_instance_by_alias("db").await.unwrap().unwrap();
    assert_eq!(holder.instance_id, "i-1");
}

#[tokio::test]
async fn test_deprovision_blocked_by_children() {
    let h = Harness::new();
    let (mut events, cancel) = start_engine(&h);

    h.lifecycle
        .provision("parent", true, &provision_body(json!({ "alias": "db" })))
        .await
        .unwrap();
    next_event(&mut events).await;
    h.lifecycle
        .provision("child", true, &provision_body(json!({ "parentAlias": "db" })))
        .await
        .unwrap();
    next_event(&mut events).await;

    let err = h
        .lifecycle
        .deprovision("parent", &DeclaredIds::default(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Conflict(_)));

    let child = h
        .lifecycle
        .deprovision("child", &DeclaredIds::default(), true)
        .await
        .unwrap();
    assert_eq!(child, Outcome::Accepted(json!({ "operation": "deprovisioning" })));
    next_event(&mut events).await;
    assert_eq!(h.store.get_instance_child_count_by_alias("db").await.unwrap(), 0);

    h.lifecycle
        .deprovision("parent", &DeclaredIds::default(), true)
        .await
        .unwrap();
    let event = next_event(&mut events).await;
    assert_eq!(event.outcome, TaskOutcome::Succeeded);

    assert!(h.store.get_instance("parent").await.unwrap().is_none());
    assert!(h.store.get_instance_by_alias("db").await.unwrap().is_none());
    assert_eq!(h.lifecycle.last_operation("parent").await.unwrap(), Outcome::Gone);
    cancel.cancel();
}

#[tokio::test]
async fn test_deprovision_checks() {
    let h = Harness::new();
    h.seed_instance("i-1", InstanceStatus::Provisioned).await;

    let gone = h
        .lifecycle
        .deprovision("missing", &DeclaredIds::default(), true)
        .await
        .unwrap();
    assert_eq!(gone, Outcome::Gone);

    let mismatched = DeclaredIds {
        service_id: Some(SERVICE_ID.to_string()),
        plan_id: Some("other-plan".to_string()),
    };
    let err = h
        .lifecycle
        .deprovision("i-1", &mismatched, true)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Conflict(_)));

    let sync = h
        .lifecycle
        .deprovision("i-1", &DeclaredIds::default(), false)
        .await
        .unwrap_err();
    assert!(matches!(sync, LifecycleError::AsyncRequired));

    // Replay while deprovisioning is still accepted
    let matching = DeclaredIds {
        service_id: Some(SERVICE_ID.to_string()),
        plan_id: Some(STANDARD_PLAN_ID.to_string()),
    };
    h.lifecycle.deprovision("i-1", &matching, true).await.unwrap();
    let again = h.lifecycle.deprovision("i-1", &matching, true).await.unwrap();
    assert!(matches!(again, Outcome::Accepted(_)));
}

#[tokio::test]
async fn test_update_flow() {
    let h = Harness::new();
    let (mut events, cancel) = start_engine(&h);
    h.seed_instance("i-1", InstanceStatus::Provisioned).await;

    let unchanged = h
        .lifecycle
        .update("i-1", true, &common::body(json!({ "service_id": SERVICE_ID })))
        .await
        .unwrap();
    assert_eq!(unchanged, Outcome::Ok(json!({})));

    let accepted = h
        .lifecycle
        .update(
            "i-1",
            true,
            &common::body(json!({ "parameters": { "someParameter": "z" } })),
        )
        .await
        .unwrap();
    assert_eq!(accepted, Outcome::Accepted(json!({ "operation": "updating" })));
    assert_eq!(
        h.store.get_instance("i-1").await.unwrap().unwrap().status,
        InstanceStatus::Updating
    );
    next_event(&mut events).await;

    let stored = h.store.get_instance("i-1").await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Provisioned);
    assert_eq!(
        stored.updating_parameters.get_string("someParameter"),
        Some("z".to_string())
    );
    cancel.cancel();
}

#[tokio::test]
async fn test_update_rejections() {
    let h = Harness::new();
    h.seed_instance("ready", InstanceStatus::Provisioned).await;
    h.seed_instance("busy", InstanceStatus::Provisioning).await;

    let missing = h
        .lifecycle
        .update("missing", true, &common::body(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(missing, LifecycleError::InstanceNotFound(_)));

    let busy = h
        .lifecycle
        .update("busy", true, &common::body(json!({})))
        .await
        .unwrap_err();
    assert_eq!(busy.status_code(), 422);

    // The fake service does not allow plan changes
    let plan_change = h
        .lifecycle
        .update("ready", true, &common::body(json!({ "plan_id": "other" })))
        .await
        .unwrap_err();
    assert!(matches!(plan_change, LifecycleError::BadRequest(_)));

    let wrong_service = h
        .lifecycle
        .update("ready", true, &common::body(json!({ "service_id": "other" })))
        .await
        .unwrap_err();
    assert!(matches!(wrong_service, LifecycleError::Conflict(_)));
}

#[tokio::test]
async fn test_update_validation_by_module() {
    let h = Harness::with_manager(FakeServiceManager::new().on_validate_update(|_| {
        Err(osbroker::domain::ValidationError::new(
            "someParameter",
            "cannot be changed",
        ))
    }));
    h.seed_instance("i-1", InstanceStatus::Provisioned).await;

    let err = h
        .lifecycle
        .update(
            "i-1",
            true,
            &common::body(json!({ "parameters": { "someParameter": "z" } })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Validation(_)));
    assert_eq!(
        h.store.get_instance("i-1").await.unwrap().unwrap().status,
        InstanceStatus::Provisioned
    );
}

#[tokio::test]
async fn test_deprovision_after_shutdown_with_queued_provision() {
    let h = Harness::new();
    let mut events = h.engine.subscribe();

    // Accepted while the engine is not yet reading its queue
    h.lifecycle
        .provision("i-1", true, &provision_body(json!({})))
        .await
        .unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();
    h.engine.run(cancel).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await.outcome,
        TaskOutcome::Interrupted { .. }
    ));

    let (state, _) = last_state(h.lifecycle.last_operation("i-1").await.unwrap());
    assert_eq!(state, "failed");

    let restarted = h.restarted();
    let (mut events, cancel) = start_engine(&restarted);
    let outcome = restarted
        .lifecycle
        .deprovision("i-1", &DeclaredIds::default(), true)
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Accepted(json!({ "operation": "deprovisioning" })));
    assert_eq!(next_event(&mut events).await.outcome, TaskOutcome::Succeeded);
    assert!(restarted.store.get_instance("i-1").await.unwrap().is_none());
    cancel.cancel();
}
