//! At most one operation per instance, however requests interleave.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use broker_common::OperationState;
use helm_broker::application::ports::LockManager;
use helm_broker::domain::error::ErrorKind;
use serde_json::Value;

use crate::support::{Fixture, PLAN_STANDARD, details};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_provisions_accept_exactly_one() {
    let fx = Arc::new(Fixture::new().await);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let fx = Arc::clone(&fx);
        handles.push(tokio::spawn(async move {
            fx.ctx
                .intake
                .provision("i-1", details(PLAN_STANDARD, Value::Null))
                .await
        }));
    }
    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict, "{e}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(fx.queue.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_requests_never_overlap() {
    let fx = Arc::new(Fixture::new().await);
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();
    fx.drain().await;

    let mut handles = Vec::new();
    for n in 0..9 {
        let fx = Arc::clone(&fx);
        handles.push(tokio::spawn(async move {
            match n % 3 {
                0 => fx.ctx.intake.bind("i-1", &format!("b-{n}")).await,
                1 => fx.ctx.intake.deprovision("i-1").await,
                _ => fx.ctx.intake.update("i-1", Default::default()).await,
            }
        }));
    }
    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict, "{e}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(fx.queue.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_hold_the_instance_lock_while_running() {
    let fx = Arc::new(Fixture::new().await);
    fx.cluster.set_install_delay(Duration::from_millis(300));
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();

    let runner = {
        let fx = Arc::clone(&fx);
        tokio::spawn(async move { fx.drain().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The worker owns the lock; a second acquirer waits for it.
    let waited = tokio::time::Instant::now();
    let mut lock = fx.locks.acquire("i-1").await.unwrap();
    assert!(waited.elapsed() >= Duration::from_millis(100));
    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
    lock.release().await;
    runner.await.unwrap();
}
