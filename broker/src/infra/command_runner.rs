//! Infrastructure implementation of the `CommandRunner` port.
//!
//! `TokioCommandRunner` runs helm, kubectl and hook scripts with a hard
//! timeout that kills the child rather than leaving it orphaned.

use std::process::{Output, Stdio};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::application::ports::{CommandRunner, CommandSpec};

/// Production `CommandRunner`.
///
/// `tokio::time::timeout` around `.output().await` would drop the future but
/// not reliably terminate the process, so the wait races an explicit
/// `child.kill()` in `tokio::select!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec<'_>) -> Result<Output> {
        let program = spec.program;
        let mut command = tokio::process::Command::new(program);
        command
            .args(spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = spec.cwd {
            command.current_dir(cwd);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stdout_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stderr_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                Ok(Output {
                    status: status.with_context(|| format!("waiting for {program}"))?,
                    stdout,
                    stderr,
                })
            } => result,
            () = tokio::time::sleep(spec.timeout) => {
                let _ = child.kill().await;
                anyhow::bail!("{program} timed out after {}s", spec.timeout.as_secs())
            }
        }
    }
}
