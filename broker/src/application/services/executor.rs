//! Command executor for the deployment tool and the cluster API tool.
//!
//! Results are `(status, output)` pairs. Spawn failures and timeouts become
//! status -1 with the reason as output so every outcome can be recorded
//! verbatim into `last_operation.description`.

use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::application::ports::{CommandRunner, CommandSpec};
use crate::domain::credential::CredentialSource;
use crate::domain::layout::Layout;

/// Status reported when a command could not run or its result is unusable.
pub const FAILED_TO_RUN: i32 = -1;

/// Slack past the deployment tool's own `--timeout` before the process is
/// killed, so the tool can report its own timeout first.
pub const KILL_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: i32,
    pub output: String,
}

impl CommandOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            status: 0,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            status: FAILED_TO_RUN,
            output: output.into(),
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Stdout followed by stderr, lossily decoded.
#[must_use]
pub fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

pub struct CommandExecutor {
    runner: Arc<dyn CommandRunner>,
    layout: Layout,
    helm_bin: String,
    kubectl_bin: String,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        layout: Layout,
        helm_bin: impl Into<String>,
        kubectl_bin: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            layout,
            helm_bin: helm_bin.into(),
            kubectl_bin: kubectl_bin.into(),
            timeout,
        }
    }

    /// Run the deployment tool with the instance's isolated configuration.
    pub async fn invoke(&self, instance_id: &str, args: &[String]) -> CommandOutcome {
        let envs = self.layout.helm_env(instance_id);
        let cwd = self.layout.instance_dir(instance_id);
        let spec = CommandSpec {
            program: &self.helm_bin,
            args,
            envs: &envs,
            cwd: Some(&cwd),
            timeout: self.timeout + KILL_GRACE,
        };
        tracing::debug!(instance_id, command = %args.first().map_or("", String::as_str), "invoking deployment tool");
        self.run(&spec).await
    }

    /// Resolve one credential value in `namespace`.
    ///
    /// Literals resolve immediately. References run a field query; secret
    /// values are additionally base64-decoded. The output is trimmed.
    pub async fn resolve_credential(&self, namespace: &str, source: &CredentialSource) -> CommandOutcome {
        if let CredentialSource::Literal(value) = source {
            return CommandOutcome::ok(value.clone());
        }
        let Some(args) = source.query_args(namespace) else {
            return CommandOutcome::failed("invalid valueFrom");
        };
        let spec = CommandSpec {
            program: &self.kubectl_bin,
            args: &args,
            envs: &[],
            cwd: None,
            timeout: self.timeout,
        };
        let outcome = self.run(&spec).await;
        if !outcome.success() {
            return outcome;
        }
        let value = outcome.output.trim();
        if !matches!(source, CredentialSource::Secret(_)) {
            return CommandOutcome::ok(value);
        }
        match STANDARD.decode(value) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(decoded) => CommandOutcome::ok(decoded),
                Err(_) => CommandOutcome::failed("secret value is not valid UTF-8"),
            },
            Err(e) => CommandOutcome::failed(format!("secret value is not valid base64: {e}")),
        }
    }

    async fn run(&self, spec: &CommandSpec<'_>) -> CommandOutcome {
        match self.runner.run(spec).await {
            Ok(output) => CommandOutcome {
                status: output.status.code().unwrap_or(FAILED_TO_RUN),
                output: combined_output(&output),
            },
            Err(e) => CommandOutcome::failed(format!("{e:#}")),
        }
    }
}
