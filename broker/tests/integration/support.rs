//! Shared fixture: an addon on disk, a loaded catalog, and a fake cluster.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use broker_common::{InstanceDetails, Parameters};
use helm_broker::app::{AppContext, Substrate};
use helm_broker::application::ports::{Cache, CommandRunner, CommandSpec, LockManager, TaskQueue};
use helm_broker::domain::config::BrokerConfig;
use helm_broker::infra::command_runner::TokioCommandRunner;
use helm_broker::infra::memory::{MemoryCache, MemoryLockManager, MemoryQueue};
use serde_json::{Value, json};
use tempfile::TempDir;

pub const SERVICE_ID: &str = "svc-redis";
pub const PLAN_STANDARD: &str = "plan-standard";
pub const PLAN_LARGE: &str = "plan-large";

const BIND_TEMPLATE: &str = "\
credential:
  - name: host
    valueFrom:
      serviceRef:
        name: {{ .Release.Name }}
        jsonpath: '{.spec.clusterIP}'
  - name: password
    valueFrom:
      secretKeyRef:
        name: {{ .Release.Name }}-auth
        jsonpath: '{.data.password}'
  - name: port
    value: 6379
";

fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(code << 8)
}

fn reply(code: i32, stdout: &str) -> Output {
    Output {
        status: exit_status(code),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

// ── Fake cluster ──────────────────────────────────────────────────────────────

/// Answers helm and kubectl from memory; hands bash through to a real shell.
#[derive(Default)]
pub struct FakeCluster {
    bash: TokioCommandRunner,
    calls: Mutex<Vec<Vec<String>>>,
    /// Exit status per helm verb; unset verbs succeed.
    helm_status: Mutex<HashMap<String, i32>>,
    /// `kubectl get <kind> <name>` answers keyed by `kind/name`.
    objects: Mutex<HashMap<String, String>>,
    install_delay: Mutex<Duration>,
}

impl FakeCluster {
    pub fn fail_helm(&self, verb: &str, status: i32) {
        self.helm_status.lock().unwrap().insert(verb.to_string(), status);
    }

    pub fn put_object(&self, kind: &str, name: &str, value: &str) {
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{kind}/{name}"), value.to_string());
    }

    pub fn set_install_delay(&self, delay: Duration) {
        *self.install_delay.lock().unwrap() = delay;
    }

    /// Recorded helm and kubectl invocations, program first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn helm_verbs(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c[0] == "helm")
            .map(|c| c[1].clone())
            .collect()
    }

    fn helm(&self, args: &[String]) -> Output {
        let verb = args.first().cloned().unwrap_or_default();
        let status = self.helm_status.lock().unwrap().get(&verb).copied().unwrap_or(0);
        if status != 0 {
            return reply(status, &format!("Error: {verb} failed\n"));
        }
        match verb.as_str() {
            "template" => {
                let release = &args[1];
                let chart = Path::new(&args[2]);
                let bind = fs::read_to_string(chart.join("templates/bind.yaml")).unwrap_or_default();
                let rendered = bind.replace("{{ .Release.Name }}", release);
                reply(
                    0,
                    &format!(
                        "---\n# Source: redis/templates/deployment.yaml\nkind: Deployment\n---\n# Source: redis/templates/bind.yaml\n{rendered}"
                    ),
                )
            }
            _ => reply(0, &format!("{verb}: ok\n")),
        }
    }

    fn kubectl(&self, args: &[String]) -> Output {
        let key = format!("{}/{}", args[1], args[2]);
        match self.objects.lock().unwrap().get(&key) {
            Some(value) => reply(0, value),
            None => reply(1, &format!("Error from server (NotFound): {key} not found\n")),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeCluster {
    async fn run(&self, spec: &CommandSpec<'_>) -> Result<Output> {
        if spec.program == "bash" {
            return self.bash.run(spec).await;
        }
        let mut call = vec![spec.program.to_string()];
        call.extend(spec.args.iter().cloned());
        self.calls.lock().unwrap().push(call);
        match spec.program {
            "helm" => {
                if spec.args.first().map(String::as_str) == Some("install") {
                    let delay = *self.install_delay.lock().unwrap();
                    tokio::time::sleep(delay).await;
                }
                Ok(self.helm(spec.args))
            }
            "kubectl" => Ok(self.kubectl(spec.args)),
            other => anyhow::bail!("unexpected program {other}"),
        }
    }
}

// ── Fixture ───────────────────────────────────────────────────────────────────

pub struct Fixture {
    pub dir: TempDir,
    pub ctx: AppContext,
    pub cluster: Arc<FakeCluster>,
    pub cache: Arc<MemoryCache>,
    pub locks: Arc<MemoryLockManager>,
    pub queue: Arc<MemoryQueue>,
}

fn write(path: &Path, text: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

/// Lay out the `redis` addon with a `standard` and a `large` plan.
pub fn write_addon(root: &Path) {
    let addon = root.join("addons/redis-6.0");
    write(
        &addon.join("meta.yaml"),
        "\
id: svc-redis
name: redis
displayName: Redis
version: '6.0'
description: in-memory store
bindable: true
plan_updateable: true
tags: database, cache
allow_parameters:
  - name: replicas
  - name: auth
    required: false
  - name: persistence.size
",
    );
    write(&addon.join("chart/redis/Chart.yaml"), "apiVersion: v2\nname: redis\nversion: 6.0.0\n");
    write(&addon.join("chart/redis/templates/deployment.yaml"), "kind: Deployment\n");
    for (dir, id) in [("standard", PLAN_STANDARD), ("large", PLAN_LARGE)] {
        let plan = addon.join("plans").join(dir);
        write(&plan.join("meta.yaml"), &format!("id: {id}\nname: {dir}\ndescription: {dir} plan\n"));
        write(&plan.join("values.yaml"), &format!("size: {dir}\n"));
        write(&plan.join("bind.yaml"), BIND_TEMPLATE);
    }
}

/// Install a hook script into a plan source.
pub fn write_hook(root: &Path, plan: &str, name: &str, body: &str) {
    write(
        &root.join("addons/redis-6.0/plans").join(plan).join("hooks").join(name),
        &format!("#!/bin/bash\n{body}\n"),
    );
}

pub fn config(root: &Path) -> BrokerConfig {
    BrokerConfig {
        config_root: root.to_path_buf(),
        command_timeout_secs: 30,
        hook_timeout_secs: 10,
        workers: 2,
        ..BrokerConfig::default()
    }
}

impl Fixture {
    /// Addon on disk, catalog loaded.
    pub async fn new() -> Self {
        Self::with_setup(|_| {}).await
    }

    /// Like [`Fixture::new`], running `setup` on the root before the catalog
    /// is loaded.
    pub async fn with_setup(setup: impl FnOnce(&Path)) -> Self {
        let dir = TempDir::new().expect("tempdir");
        write_addon(dir.path());
        setup(dir.path());

        let cluster = Arc::new(FakeCluster::default());
        let cache = Arc::new(MemoryCache::new());
        let locks = Arc::new(MemoryLockManager::new());
        let queue = Arc::new(MemoryQueue::new());
        let substrate = Substrate {
            cache: Arc::clone(&cache) as Arc<dyn Cache>,
            locks: Arc::clone(&locks) as Arc<dyn LockManager>,
            queue: Arc::clone(&queue) as Arc<dyn TaskQueue>,
        };
        let runner: Arc<dyn CommandRunner> = Arc::clone(&cluster) as Arc<dyn CommandRunner>;
        let ctx = AppContext::with_runner(config(dir.path()), substrate, runner);
        ctx.catalog.load().await.expect("catalog loads");
        Self {
            dir,
            ctx,
            cluster,
            cache,
            locks,
            queue,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.root().join("instances").join(id)
    }

    /// Run every queued task on this thread.
    pub async fn drain(&self) -> usize {
        self.ctx.workers.drain(Duration::from_millis(20)).await.expect("drain")
    }
}

pub fn details(plan_id: &str, parameters: Value) -> InstanceDetails {
    let parameters: Option<Parameters> = if parameters.is_null() {
        None
    } else {
        Some(serde_json::from_value(parameters).unwrap())
    };
    let context: BTreeMap<String, Value> =
        serde_json::from_value(json!({"instance_name": "cache-1", "namespace": "team-a"})).unwrap();
    InstanceDetails {
        service_id: SERVICE_ID.to_string(),
        plan_id: plan_id.to_string(),
        context,
        parameters,
    }
}
