//! Bind and unbind: template injection, credential resolution, reads.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use broker_common::{Binding, Operation, OperationState};
use helm_broker::domain::error::ErrorKind;
use serde_json::Value;

use crate::support::{Fixture, PLAN_STANDARD, details};

async fn provisioned() -> Fixture {
    let fx = Fixture::new().await;
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();
    fx.drain().await;
    fx
}

#[tokio::test]
async fn bind_resolves_every_credential() {
    let fx = provisioned().await;
    fx.cluster.put_object("svc", "cache-1", "10.0.0.7");
    fx.cluster.put_object("secret", "cache-1-auth", &STANDARD.encode("s3cret"));

    let pending = fx.ctx.intake.bind("i-1", "b-1").await.unwrap();
    assert_eq!(pending.operation, Operation::Bind);
    let op = fx.ctx.intake.get_binding_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::InProgress);
    assert_eq!(fx.ctx.intake.get_binding("i-1").await.unwrap_err().kind(), ErrorKind::Conflict);

    fx.drain().await;
    let binding = fx.ctx.intake.get_binding("i-1").await.unwrap();
    assert_eq!(binding.binding_id, "b-1");
    assert_eq!(binding.credentials["host"], "10.0.0.7");
    assert_eq!(binding.credentials["password"], "s3cret");
    assert_eq!(binding.credentials["port"], "6379");

    // The injected template never outlives the render.
    assert!(!fx.instance_dir("i-1").join("chart/templates/bind.yaml").exists());
    let kubectl: Vec<Vec<String>> = fx.cluster.calls().into_iter().filter(|c| c[0] == "kubectl").collect();
    assert_eq!(kubectl.len(), 2);
    assert!(kubectl[0].windows(2).any(|w| w == ["-n", "team-a"]));
}

#[tokio::test]
async fn partial_resolution_keeps_only_resolved_credentials() {
    let fx = provisioned().await;
    fx.cluster.put_object("svc", "cache-1", "10.0.0.7");

    fx.ctx.intake.bind("i-1", "b-1").await.unwrap();
    fx.drain().await;

    let binding: Binding = fx.ctx.metadata.load("i-1").await.unwrap();
    assert_eq!(binding.last_operation.state, OperationState::Failed);
    assert!(binding.last_operation.description.contains("password"));
    assert!(binding.last_operation.description.contains("NotFound"));
    assert_eq!(binding.credentials.len(), 2);
    assert!(!binding.credentials.contains_key("password"));
}

#[tokio::test]
async fn failed_render_fails_the_binding() {
    let fx = provisioned().await;
    fx.cluster.fail_helm("template", 1);
    fx.ctx.intake.bind("i-1", "b-1").await.unwrap();
    fx.drain().await;

    let op = fx.ctx.intake.get_binding_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.description.contains("template failed"));
    assert!(!fx.instance_dir("i-1").join("chart/templates/bind.yaml").exists());
}

#[tokio::test]
async fn single_binding_per_instance() {
    let fx = provisioned().await;
    fx.ctx.intake.bind("i-1", "b-1").await.unwrap();
    let err = fx.ctx.intake.bind("i-1", "b-2").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    fx.drain().await;
    let err = fx.ctx.intake.bind("i-1", "b-2").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn bind_requires_a_provisioned_instance() {
    let fx = Fixture::new().await;
    fx.cluster.fail_helm("install", 1);
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();

    let err = fx.ctx.intake.bind("i-1", "b-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict, "in flight");

    fx.drain().await;
    let err = fx.ctx.intake.bind("i-1", "b-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest, "failed provision");

    let err = fx.ctx.intake.bind("i-1", "").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn unbind_removes_the_binding() {
    let fx = provisioned().await;
    fx.ctx.intake.bind("i-1", "b-1").await.unwrap();
    fx.drain().await;

    let err = fx.ctx.intake.unbind("i-1", "b-other").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let pending = fx.ctx.intake.unbind("i-1", "b-1").await.unwrap();
    assert_eq!(pending.operation, Operation::Unbind);
    let err = fx.ctx.intake.unbind("i-1", "b-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    fx.drain().await;
    let err = fx.ctx.intake.get_binding_operation("i-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!fx.instance_dir("i-1").join("binding.json").exists());

    // Bindable again once the old binding is gone.
    fx.ctx.intake.bind("i-1", "b-2").await.unwrap();
}

#[tokio::test]
async fn unbind_without_the_lease_keeps_the_binding() {
    let fx = provisioned().await;
    fx.ctx.intake.bind("i-1", "b-1").await.unwrap();
    fx.drain().await;

    fx.locks.set_lose_leases(true);
    fx.ctx.intake.unbind("i-1", "b-1").await.unwrap();
    fx.drain().await;

    let binding: Binding = fx.ctx.metadata.load("i-1").await.unwrap();
    assert_eq!(binding.binding_id, "b-1");
    assert_eq!(
        (binding.last_operation.operation, binding.last_operation.state),
        (Operation::Unbind, OperationState::Failed)
    );
    assert!(binding.last_operation.description.contains("lock lease lost"));
}
