//! Provision, update and deprovision through intake and workers.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use broker_common::{Operation, OperationState, ServiceInstance};
use helm_broker::application::ports::TaskQueue;
use helm_broker::application::services::intake::UpdateRequest;
use helm_broker::application::services::worker::{MAX_ATTEMPTS, WorkerPool};
use helm_broker::domain::error::{BrokerError, ErrorKind};
use serde_json::{Value, json};

use crate::support::{Fixture, PLAN_LARGE, PLAN_STANDARD, SERVICE_ID, details};

fn install_call(fx: &Fixture) -> Vec<String> {
    fx.cluster
        .calls()
        .into_iter()
        .find(|c| c[0] == "helm" && c[1] == "install")
        .expect("helm install was called")
}

#[tokio::test]
async fn provision_then_deprovision() {
    let fx = Fixture::new().await;
    let pending = fx
        .ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, json!({"replicas": 2})))
        .await
        .unwrap();
    assert_eq!(pending.operation, Operation::Provision);
    assert_eq!(pending.instance_id, "i-1");

    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::InProgress);

    assert_eq!(fx.drain().await, 1);
    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!((op.operation, op.state), (Operation::Provision, OperationState::Succeeded));

    let install = install_call(&fx);
    assert_eq!(install[2], "cache-1");
    assert!(install.windows(2).any(|w| w == ["--namespace", "team-a"]));
    assert!(install.windows(2).any(|w| w == ["--set", "replicas=2"]));
    assert!(install.iter().any(|a| a.ends_with("plan/values.yaml")));
    assert!(fx.instance_dir("i-1").join("chart/Chart.yaml").exists());
    assert!(fx.instance_dir("i-1").join("backups").exists());

    fx.ctx.intake.deprovision("i-1").await.unwrap();
    assert_eq!(fx.drain().await, 1);
    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!((op.operation, op.state), (Operation::Deprovision, OperationState::Succeeded));
    assert!(fx.cluster.helm_verbs().contains(&"uninstall".to_string()));

    let err = fx.ctx.intake.deprovision("i-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert_eq!(fx.ctx.reaper.clean().await.unwrap(), vec!["i-1"]);
    assert!(!fx.instance_dir("i-1").exists());
}

#[tokio::test]
async fn reprovision_is_rejected_without_enqueue() {
    let fx = Fixture::new().await;
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();
    assert_eq!(fx.queue.len(), 1);

    let err = fx
        .ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Conflict(_)), "{err}");
    assert_eq!(fx.queue.len(), 1);

    fx.drain().await;
    let err = fx
        .ctx
        .intake
        .provision("i-1", details(PLAN_LARGE, Value::Null))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(fx.queue.is_empty());
    assert_eq!(fx.cluster.helm_verbs(), vec!["install"]);
}

#[tokio::test]
async fn unknown_instances_are_not_found() {
    let fx = Fixture::new().await;
    for err in [
        fx.ctx.intake.deprovision("nope").await.unwrap_err(),
        fx.ctx.intake.get_operation("nope").await.unwrap_err(),
        fx.ctx.intake.bind("nope", "b-1").await.unwrap_err(),
        fx.ctx.intake.unbind("nope", "b-1").await.unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::NotFound, "{err}");
    }
    assert!(fx.queue.is_empty());
}

#[tokio::test]
async fn invalid_provision_requests_leave_no_trace() {
    let fx = Fixture::new().await;
    let mut missing_context = details(PLAN_STANDARD, Value::Null);
    missing_context.context.remove("namespace");
    let mut unknown_service = details(PLAN_STANDARD, Value::Null);
    unknown_service.service_id = "svc-nope".into();

    let cases = [
        details("plan-nope", Value::Null),
        details(PLAN_STANDARD, json!({"image.tag": "v1"})),
        details(PLAN_STANDARD, json!({"rawValues": "%%% not base64"})),
        missing_context,
        unknown_service,
    ];
    for request in cases {
        let err = fx.ctx.intake.provision("i-1", request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest, "{err}");
    }
    let err = fx
        .ctx
        .intake
        .provision("bad:id", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    assert!(fx.queue.is_empty());
    assert!(!fx.instance_dir("i-1").exists());
}

#[tokio::test]
async fn disallowed_parameters_are_listed() {
    let fx = Fixture::new().await;
    let err = fx
        .ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, json!({"image": {"tag": "v1"}, "replicas": 1})))
        .await
        .unwrap_err();
    match err {
        BrokerError::InvalidParameters { disallowed, missing } => {
            assert_eq!(disallowed, "image.tag");
            assert!(missing.is_empty());
        }
        other => panic!("unexpected {other}"),
    }
}

#[tokio::test]
async fn failed_install_records_tool_output() {
    let fx = Fixture::new().await;
    fx.cluster.fail_helm("install", 1);
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();
    fx.drain().await;

    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.description.contains("Error: install failed"), "{}", op.description);

    // A failed instance can still be torn down.
    fx.ctx.intake.deprovision("i-1").await.unwrap();
    fx.drain().await;
    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
}

#[tokio::test]
async fn values_overlays_are_passed_in_order() {
    let fx = Fixture::with_setup(|root| {
        fs::create_dir_all(root.join("config")).unwrap();
        fs::write(
            root.join("config/addon-values"),
            "redis:\n  '6.0':\n    maxmemory: 1gb\n  '5.0':\n    maxmemory: 512mb\n",
        )
        .unwrap();
    })
    .await;
    let raw = STANDARD.encode("persistence:\n  size: 8Gi\n");
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, json!({"rawValues": raw})))
        .await
        .unwrap();
    fx.drain().await;

    let addon_values = fs::read_to_string(fx.instance_dir("i-1").join("addon-values.yaml")).unwrap();
    assert!(addon_values.contains("maxmemory: 1gb"));
    let custom = fs::read_to_string(fx.instance_dir("i-1").join("custom-addon-values.yaml")).unwrap();
    assert!(custom.contains("size: 8Gi"));

    let files: Vec<String> = install_call(&fx)
        .windows(2)
        .filter(|w| w[0] == "-f")
        .map(|w| w[1].clone())
        .collect();
    assert_eq!(files.len(), 3);
    assert!(files[0].ends_with("plan/values.yaml"));
    assert!(files[1].ends_with("addon-values.yaml"));
    assert!(files[2].ends_with("custom-addon-values.yaml"));
}

#[tokio::test]
async fn update_switches_plan_and_merges_parameters() {
    let fx = Fixture::new().await;
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, json!({"replicas": 2, "auth": "on"})))
        .await
        .unwrap();
    fx.drain().await;

    let request = UpdateRequest {
        service_id: Some(SERVICE_ID.into()),
        plan_id: Some(PLAN_LARGE.into()),
        parameters: Some(serde_json::from_value(json!({"auth": ""})).unwrap()),
    };
    let pending = fx.ctx.intake.update("i-1", request).await.unwrap();
    assert_eq!(pending.operation, Operation::Update);

    // In flight: a second request conflicts.
    let err = fx.ctx.intake.deprovision("i-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    fx.drain().await;
    let instance: ServiceInstance = fx.ctx.metadata.load("i-1").await.unwrap();
    assert_eq!(instance.last_operation.state, OperationState::Succeeded);
    assert_eq!(instance.details.plan_id, PLAN_LARGE);
    assert_eq!(
        serde_json::to_value(&instance.details.parameters).unwrap(),
        json!({"replicas": 2})
    );
    let values = fs::read_to_string(fx.instance_dir("i-1").join("plan/values.yaml")).unwrap();
    assert_eq!(values, "size: large\n");

    let upgrade = fx
        .cluster
        .calls()
        .into_iter()
        .find(|c| c[0] == "helm" && c[1] == "upgrade")
        .unwrap();
    assert!(upgrade.contains(&"--reuse-values".to_string()));
}

#[tokio::test]
async fn update_rejects_other_services() {
    let fx = Fixture::new().await;
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();
    fx.drain().await;
    let request = UpdateRequest {
        service_id: Some("svc-other".into()),
        ..UpdateRequest::default()
    };
    let err = fx.ctx.intake.update("i-1", request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn unavailable_locks_are_retried_then_abandoned() {
    let fx = Fixture::new().await;
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();
    fx.locks.set_unavailable(true);

    let pool = WorkerPool::new(
        Arc::clone(&fx.ctx.orchestrator),
        Arc::clone(&fx.queue) as Arc<dyn TaskQueue>,
        "test",
        1,
    )
    .with_timing(Duration::from_millis(20), Duration::from_millis(1));
    let handled = pool.drain(Duration::from_millis(50)).await.unwrap();
    assert_eq!(handled, MAX_ATTEMPTS as usize);

    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.description.contains("abandoned"), "{}", op.description);
    assert!(fx.cluster.helm_verbs().is_empty());
}

#[tokio::test]
async fn worker_pool_stops_on_shutdown() {
    let fx = Fixture::new().await;
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let pool = Arc::new(
        WorkerPool::new(
            Arc::clone(&fx.ctx.orchestrator),
            Arc::clone(&fx.queue) as Arc<dyn TaskQueue>,
            "test",
            2,
        )
        .with_timing(Duration::from_millis(20), Duration::from_millis(1)),
    );
    let running = tokio::spawn(Arc::clone(&pool).run(rx));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
        if op.state == OperationState::Succeeded {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "provision never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("pool stops")
        .unwrap();
}

#[tokio::test]
async fn nested_parameters_become_dotted_overrides() {
    let fx = Fixture::new().await;
    fx.ctx
        .intake
        .provision(
            "i-1",
            details(PLAN_STANDARD, json!({"persistence": {"size": "8Gi"}, "replicas": 3})),
        )
        .await
        .unwrap();
    fx.drain().await;

    let install = install_call(&fx);
    assert!(install.windows(2).any(|w| w == ["--set", "persistence.size=8Gi"]), "{install:?}");
    assert!(install.windows(2).any(|w| w == ["--set", "replicas=3"]));
    assert!(!install.iter().any(|a| a.starts_with("persistence={")));
}

#[tokio::test]
async fn clearing_raw_values_drops_the_overlay() {
    let fx = Fixture::new().await;
    let raw = STANDARD.encode("persistence:\n  size: 8Gi\n");
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, json!({"rawValues": raw})))
        .await
        .unwrap();
    fx.drain().await;
    let custom = fx.instance_dir("i-1").join("custom-addon-values.yaml");
    assert!(custom.exists());

    let request = UpdateRequest {
        parameters: Some(serde_json::from_value(json!({"rawValues": ""})).unwrap()),
        ..UpdateRequest::default()
    };
    fx.ctx.intake.update("i-1", request).await.unwrap();
    fx.drain().await;

    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!((op.operation, op.state), (Operation::Update, OperationState::Succeeded));
    assert!(!custom.exists());
    let upgrade = fx
        .cluster
        .calls()
        .into_iter()
        .find(|c| c[0] == "helm" && c[1] == "upgrade")
        .unwrap();
    assert!(!upgrade.iter().any(|a| a.ends_with("custom-addon-values.yaml")), "{upgrade:?}");
}

#[tokio::test]
async fn deprovision_conflicts_with_running_provision() {
    let fx = Fixture::new().await;
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();

    let err = fx.ctx.intake.deprovision("i-1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(fx.queue.len(), 1);

    fx.drain().await;
    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!((op.operation, op.state), (Operation::Provision, OperationState::Succeeded));
}

#[tokio::test]
async fn task_of_a_dead_worker_is_redelivered() {
    let fx = Fixture::new().await;
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();

    // Taken by a worker that dies before settling it.
    let consumer = fx.ctx.workers.consumer(0);
    let task = fx
        .queue
        .dequeue(&consumer, Duration::from_millis(20))
        .await
        .unwrap()
        .expect("task queued");
    assert!(fx.queue.is_empty());
    assert_eq!(fx.queue.in_flight(&consumer), 1);
    assert_eq!(fx.drain().await, 0);

    assert_eq!(fx.ctx.workers.recover().await.unwrap(), 1);
    assert_eq!(fx.drain().await, 1);
    assert_eq!(fx.queue.in_flight(&consumer), 0);
    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);

    // A second delivery of a settled task changes nothing.
    fx.queue.enqueue(&task).await.unwrap();
    assert_eq!(fx.drain().await, 1);
    assert_eq!(fx.cluster.helm_verbs(), vec!["install"]);
    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
}

#[tokio::test]
async fn refused_requeue_abandons_the_task() {
    let fx = Fixture::new().await;
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();
    fx.locks.set_unavailable(true);
    fx.queue.set_refuse_enqueue(true);

    let pool = WorkerPool::new(
        Arc::clone(&fx.ctx.orchestrator),
        Arc::clone(&fx.queue) as Arc<dyn TaskQueue>,
        "test",
        1,
    )
    .with_timing(Duration::from_millis(20), Duration::from_millis(1));
    assert_eq!(pool.drain(Duration::from_millis(50)).await.unwrap(), 1);

    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.description.contains("requeue failed"), "{}", op.description);
    assert!(fx.queue.is_empty());
    assert_eq!(fx.queue.in_flight(&pool.consumer(0)), 0);
}

#[tokio::test]
async fn lost_lease_fails_the_operation() {
    let fx = Fixture::new().await;
    fx.locks.set_lose_leases(true);
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();
    fx.drain().await;

    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.description.contains("lock lease lost"), "{}", op.description);
    assert_eq!(fx.locks.tracked(), 0);
}
