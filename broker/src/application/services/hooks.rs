//! Pre/post hook scripts around every lifecycle stage.
//!
//! [`HookRunner::run`] is a scoped wrapper: the pre-hook runs first and its
//! record is handed to the body; the post-hook and the persisted
//! [`HookResult`] happen on every exit path, including a panicking body.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use broker_common::{HookPhase, HookRecord, HookResult, Operation};
use chrono::Utc;
use futures::FutureExt;

use crate::application::ports::{CommandRunner, CommandSpec, FileStore};
use crate::application::services::executor::combined_output;
use crate::application::services::metadata::MetadataStore;
use crate::domain::error::{BrokerError, BrokerResult};
use crate::domain::layout::Layout;

/// Interpreter for hook scripts. Scripts need not be executable.
const HOOK_SHELL: &str = "bash";

/// Parse a stage name, failing before any script runs.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidRequest`] for anything but the five
/// lifecycle stages.
pub fn parse_stage(stage: &str) -> BrokerResult<Operation> {
    stage
        .parse()
        .map_err(|e: broker_common::UnknownOperation| BrokerError::InvalidRequest(e.to_string()))
}

pub struct HookRunner {
    runner: Arc<dyn CommandRunner>,
    files: Arc<dyn FileStore>,
    metadata: Arc<MetadataStore>,
    layout: Layout,
    timeout: Duration,
}

impl HookRunner {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        files: Arc<dyn FileStore>,
        metadata: Arc<MetadataStore>,
        timeout: Duration,
    ) -> Self {
        let layout = metadata.layout().clone();
        Self {
            runner,
            files,
            metadata,
            layout,
            timeout,
        }
    }

    /// Run `body` between the stage's pre- and post-hooks.
    ///
    /// The body receives the pre-hook record and decides whether to
    /// short-circuit. The hook result is persisted before the body's own
    /// result is returned; if the body panicked, the panic resumes after
    /// persistence.
    ///
    /// # Errors
    ///
    /// Returns the body's error, or the persistence error when the body
    /// succeeded but the hook result could not be saved.
    pub async fn run<F, Fut, T>(&self, instance_id: &str, stage: Operation, body: F) -> BrokerResult<T>
    where
        F: FnOnce(HookRecord) -> Fut + Send,
        Fut: Future<Output = BrokerResult<T>> + Send,
        T: Send,
    {
        let pre = self.run_phase(instance_id, stage, HookPhase::Pre).await;
        let outcome = AssertUnwindSafe(body(pre.clone())).catch_unwind().await;
        let post = self.run_phase(instance_id, stage, HookPhase::Post).await;

        let mut result = HookResult {
            instance_id: instance_id.to_string(),
            stage,
            records: vec![pre, post],
            last_modified_time: Utc::now(),
        };
        let persisted = self.metadata.save(instance_id, &mut result).await;

        match outcome {
            Err(panic) => {
                if let Err(e) = &persisted {
                    tracing::error!(instance_id, stage = %stage, error = %e, "hook result not persisted");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Err(e)) => {
                if let Err(pe) = persisted {
                    tracing::error!(instance_id, stage = %stage, error = %pe, "hook result not persisted");
                }
                Err(e)
            }
            Ok(Ok(value)) => persisted.map(|()| value),
        }
    }

    /// Run one phase's script if installed. Never fails: a script that
    /// cannot run is recorded with status -1 and the reason as output.
    pub async fn run_phase(&self, instance_id: &str, stage: Operation, phase: HookPhase) -> HookRecord {
        let script = self.layout.hook_script(instance_id, stage, phase);
        match self.files.exists(&script).await {
            Ok(true) => {}
            Ok(false) => return HookRecord::absent(phase),
            Err(e) => {
                return HookRecord {
                    phase,
                    script_path: Some(script.to_string_lossy().into_owned()),
                    exit_status: -1,
                    output: format!("cannot stat hook script: {e:#}"),
                };
            }
        }
        let record = self.execute(instance_id, stage, phase, &script).await;
        if record.succeeded() {
            tracing::info!(instance_id, stage = %stage, phase = %phase, "hook succeeded");
        } else {
            tracing::warn!(
                instance_id,
                stage = %stage,
                phase = %phase,
                exit_status = record.exit_status,
                "hook failed"
            );
        }
        record
    }

    async fn execute(&self, instance_id: &str, stage: Operation, phase: HookPhase, script: &Path) -> HookRecord {
        let instance_dir = self.layout.instance_dir(instance_id);
        let script_path = script.to_string_lossy().into_owned();
        let args = vec![script_path.clone()];
        let envs = vec![
            ("INSTANCE_ID".to_string(), instance_id.to_string()),
            (
                "INSTANCE_PATH".to_string(),
                instance_dir.to_string_lossy().into_owned(),
            ),
            ("HOOK_STAGE".to_string(), stage.to_string()),
            ("HOOK_PHASE".to_string(), phase.to_string()),
        ];
        let spec = CommandSpec {
            program: HOOK_SHELL,
            args: &args,
            envs: &envs,
            cwd: Some(&instance_dir),
            timeout: self.timeout,
        };
        match self.runner.run(&spec).await {
            Ok(output) => HookRecord {
                phase,
                script_path: Some(script_path),
                exit_status: output.status.code().unwrap_or(-1),
                output: combined_output(&output),
            },
            Err(e) => HookRecord {
                phase,
                script_path: Some(script_path),
                exit_status: -1,
                output: format!("{e:#}"),
            },
        }
    }
}
