//! Plan hook scripts around lifecycle commands.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use broker_common::{HookPhase, HookResult, Operation, OperationState};
use serde_json::Value;

use crate::support::{Fixture, PLAN_STANDARD, details, write_hook};

#[tokio::test]
async fn failing_pre_hook_skips_the_command_but_not_the_post_hook() {
    let fx = Fixture::with_setup(|root| {
        write_hook(root, "standard", "pre-provision.sh", "echo 'quota exceeded'; exit 3");
        write_hook(root, "standard", "post-provision.sh", "touch \"$INSTANCE_PATH/post-ran\"");
    })
    .await;
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();
    fx.drain().await;

    let op = fx.ctx.intake.get_operation("i-1").await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.description.contains("pre-provision hook failed with status 3"));
    assert!(op.description.contains("quota exceeded"));
    assert!(fx.cluster.helm_verbs().is_empty());
    assert!(fx.instance_dir("i-1").join("post-ran").exists());

    let result: HookResult = fx.ctx.metadata.load("i-1").await.unwrap();
    assert_eq!(result.stage, Operation::Provision);
    assert_eq!(result.records.len(), 2);
    assert_eq!(result.records[0].phase, HookPhase::Pre);
    assert_eq!(result.records[0].exit_status, 3);
    assert_eq!(result.records[1].phase, HookPhase::Post);
    assert!(result.records[1].succeeded());
}

#[tokio::test]
async fn hooks_see_the_instance_environment() {
    let fx = Fixture::with_setup(|root| {
        write_hook(
            root,
            "standard",
            "post-deprovision.sh",
            "echo \"$INSTANCE_ID $HOOK_STAGE $HOOK_PHASE\" > \"$INSTANCE_PATH/env.txt\"",
        );
    })
    .await;
    fx.ctx
        .intake
        .provision("i-1", details(PLAN_STANDARD, Value::Null))
        .await
        .unwrap();
    fx.drain().await;

    // No provision hooks installed: both phases are recorded as absent.
    let result: HookResult = fx.ctx.metadata.load("i-1").await.unwrap();
    assert!(result.records.iter().all(|r| r.script_path.is_none()));

    fx.ctx.intake.deprovision("i-1").await.unwrap();
    fx.drain().await;
    let env = std::fs::read_to_string(fx.instance_dir("i-1").join("env.txt")).unwrap();
    assert_eq!(env.trim(), "i-1 deprovision post");
}
