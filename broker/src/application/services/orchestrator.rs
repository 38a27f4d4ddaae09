//! Lifecycle orchestrator: the task bodies run by workers.
//!
//! Every task holds the instance lock for its whole duration and runs inside
//! the stage's hook scope. Execution failures are recorded into the
//! document's `last_operation`; only substrate and savepoint faults surface
//! as `Err`.
//!
//! Delivery is at-least-once, so a task only runs while its document still
//! shows that operation in progress. An outcome reached after the lock lease
//! was lost is recorded as a failure.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use broker_common::{
    Binding, Catalog, HookRecord, InstanceDetails, LastOperation, Operation, OperationState,
    ServiceInstance, TaskMessage,
};

use crate::application::ports::{FileStore, LeaseWatch, LockManager};
use crate::application::services::executor::{CommandExecutor, CommandOutcome};
use crate::application::services::hooks::HookRunner;
use crate::application::services::metadata::MetadataStore;
use crate::application::services::savepoint::SavepointManager;
use crate::domain::credential::{CredentialEntry, parse_bind_template};
use crate::domain::error::{BrokerError, BrokerResult};
use crate::domain::helm::{self, Release};
use crate::domain::layout::Layout;
use crate::domain::validate::decode_raw_values;

pub struct Orchestrator {
    metadata: Arc<MetadataStore>,
    locks: Arc<dyn LockManager>,
    files: Arc<dyn FileStore>,
    hooks: HookRunner,
    savepoints: SavepointManager,
    executor: CommandExecutor,
    layout: Layout,
    command_timeout: Duration,
}

/// Release name and namespace taken from the instance context.
struct Target {
    name: String,
    namespace: String,
}

impl Target {
    fn of(details: &InstanceDetails) -> Result<Self, String> {
        let name = details
            .instance_name()
            .ok_or("context.instance_name is missing")?;
        let namespace = details.namespace().ok_or("context.namespace is missing")?;
        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
        })
    }
}

fn hook_failure(stage: Operation, pre: &HookRecord) -> String {
    format!(
        "pre-{stage} hook failed with status {}: {}",
        pre.exit_status, pre.output
    )
}

/// The outcome to record. Once the lease is lost another holder may have
/// acted on the instance, so a non-failure is not trustworthy.
fn under_lease(lease: &LeaseWatch, op: Operation, last: LastOperation) -> LastOperation {
    if !lease.is_lost() || last.state == OperationState::Failed {
        return last;
    }
    tracing::error!(operation = %op, "lock lease lost before the outcome was recorded");
    LastOperation::failed(
        op,
        format!("lock lease lost during {op}; unconfirmed outcome: {}", last.description),
    )
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Arc<MetadataStore>,
        locks: Arc<dyn LockManager>,
        files: Arc<dyn FileStore>,
        hooks: HookRunner,
        savepoints: SavepointManager,
        executor: CommandExecutor,
        command_timeout: Duration,
    ) -> Self {
        let layout = metadata.layout().clone();
        Self {
            metadata,
            locks,
            files,
            hooks,
            savepoints,
            executor,
            layout,
            command_timeout,
        }
    }

    /// Run one queued task to completion.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Unavailable`] when the lock or metadata substrate is
    /// unreachable (retryable), otherwise internal faults. Failures of the
    /// external tools are recorded, not returned.
    pub async fn execute(&self, task: &TaskMessage) -> BrokerResult<()> {
        let id = task.instance_id.as_str();
        tracing::info!(instance_id = id, operation = %task.operation, task_id = %task.task_id, "task started");
        let result = match task.operation {
            Operation::Provision => self.provision(id).await,
            Operation::Update => match &task.details {
                Some(details) => self.update(id, details).await,
                None => Err(BrokerError::InvalidRequest(
                    "update task carries no request details".into(),
                )),
            },
            Operation::Bind => self.bind(id).await,
            Operation::Unbind => self.unbind(id).await,
            Operation::Deprovision => self.deprovision(id).await,
        };
        match &result {
            Ok(()) => tracing::info!(instance_id = id, operation = %task.operation, "task finished"),
            Err(e) => tracing::error!(instance_id = id, operation = %task.operation, error = %e, "task failed"),
        }
        result
    }

    /// Record a task that will never run as failed.
    ///
    /// # Errors
    ///
    /// Returns the metadata error when the failure cannot be recorded.
    pub async fn abandon(&self, task: &TaskMessage, reason: &str) -> BrokerResult<()> {
        let id = task.instance_id.as_str();
        let description = format!("{} abandoned: {reason}", task.operation);
        match task.operation {
            Operation::Bind | Operation::Unbind => {
                self.finish_binding(id, LastOperation::failed(task.operation, description), None)
                    .await
            }
            op => self.finish_instance(id, LastOperation::failed(op, description)).await,
        }
    }

    /// Hold the instance lock around the stage's hook scope. The body gets
    /// the pre-hook record and the lease state of the lock.
    ///
    /// A task whose document no longer awaits `stage` was settled by an
    /// earlier delivery and is skipped without running hooks.
    async fn locked<F, Fut>(&self, instance_id: &str, stage: Operation, body: F) -> BrokerResult<()>
    where
        F: FnOnce(HookRecord, LeaseWatch) -> Fut + Send,
        Fut: std::future::Future<Output = BrokerResult<()>> + Send,
    {
        let mut lock = self.locks.acquire(instance_id).await?;
        tracing::debug!(instance_id, stage = %stage, "lock acquired");
        let result = match self.awaits(instance_id, stage).await {
            Ok(true) => {
                let lease = lock.watch();
                self.hooks
                    .run(instance_id, stage, move |pre| body(pre, lease))
                    .await
            }
            Ok(false) => {
                tracing::info!(instance_id, stage = %stage, "operation already settled, skipping delivery");
                Ok(())
            }
            Err(e) => Err(e),
        };
        lock.release().await;
        result
    }

    /// Whether the document still shows `op` in progress.
    async fn awaits(&self, instance_id: &str, op: Operation) -> BrokerResult<bool> {
        let last = if op.is_binding() {
            self.metadata
                .try_load::<Binding>(instance_id)
                .await?
                .map(|b| b.last_operation)
        } else {
            self.metadata
                .try_load::<ServiceInstance>(instance_id)
                .await?
                .map(|i| i.last_operation)
        };
        Ok(last.is_some_and(|last| last.operation == op && last.is_in_progress()))
    }

    async fn finish_instance(&self, instance_id: &str, last_operation: LastOperation) -> BrokerResult<()> {
        let mut instance: ServiceInstance = self.metadata.load(instance_id).await?;
        instance.last_operation = last_operation;
        self.metadata.save(instance_id, &mut instance).await
    }

    async fn finish_binding(
        &self,
        instance_id: &str,
        last_operation: LastOperation,
        credentials: Option<BTreeMap<String, String>>,
    ) -> BrokerResult<()> {
        let mut binding: Binding = self.metadata.load(instance_id).await?;
        binding.last_operation = last_operation;
        if let Some(credentials) = credentials {
            binding.credentials = credentials;
        }
        self.metadata.save(instance_id, &mut binding).await
    }

    /// Snapshot, marking the instance failed when the savepoint cannot be
    /// taken.
    async fn snapshot_instance(&self, instance_id: &str, op: Operation, include_document: bool) -> BrokerResult<()> {
        if let Err(e) = self.savepoints.snapshot(instance_id, include_document).await {
            let description = format!("savepoint failed: {e:#}");
            self.finish_instance(instance_id, LastOperation::failed(op, description))
                .await?;
            return Err(e);
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        instance_id: &str,
        op: Operation,
        lease: &LeaseWatch,
        outcome: CommandOutcome,
    ) -> BrokerResult<()> {
        let last_operation = if outcome.success() {
            LastOperation::succeeded(op, format!("{op} succeeded"))
        } else {
            LastOperation::failed(op, outcome.output)
        };
        self.finish_instance(instance_id, under_lease(lease, op, last_operation))
            .await
    }

    /// Values overlays present on disk, in precedence order.
    async fn values_files(&self, instance_id: &str) -> BrokerResult<Vec<PathBuf>> {
        let mut present = Vec::new();
        for file in [
            self.layout.plan_values_file(instance_id),
            self.layout.addon_values_file(instance_id),
            self.layout.custom_values_file(instance_id),
        ] {
            if self.files.exists(&file).await? {
                present.push(file);
            }
        }
        Ok(present)
    }

    async fn remove_chart_bind_template(&self, instance_id: &str) {
        let path = self.layout.chart_bind_template(instance_id);
        if let Err(e) = self.files.remove_file(&path).await {
            tracing::warn!(instance_id, error = %format!("{e:#}"), "could not remove injected bind template");
        }
    }

    // ── provision ─────────────────────────────────────────────────────────────

    async fn provision(&self, instance_id: &str) -> BrokerResult<()> {
        const OP: Operation = Operation::Provision;
        self.locked(instance_id, OP, |pre, lease| async move {
            if !pre.succeeded() {
                return self
                    .finish_instance(instance_id, LastOperation::failed(OP, hook_failure(OP, &pre)))
                    .await;
            }
            let instance: ServiceInstance = self.metadata.load(instance_id).await?;
            let target = match Target::of(&instance.details) {
                Ok(t) => t,
                Err(reason) => {
                    return self
                        .finish_instance(instance_id, LastOperation::failed(OP, reason))
                        .await;
                }
            };
            self.snapshot_instance(instance_id, OP, false).await?;
            self.remove_chart_bind_template(instance_id).await;

            let chart = self.layout.chart_dir(instance_id);
            if let Some(outcome) = self.refresh_dependencies(instance_id).await? {
                if !outcome.success() {
                    return self.record_outcome(instance_id, OP, &lease, outcome).await;
                }
            }

            let values = self.values_files(instance_id).await?;
            let overrides = instance
                .details
                .parameters
                .as_ref()
                .map(broker_common::Parameters::set_overrides)
                .unwrap_or_default();
            let release = Release {
                name: &target.name,
                namespace: &target.namespace,
                chart: &chart,
                values: &values,
                overrides: &overrides,
            };
            let outcome = self
                .executor
                .invoke(instance_id, &helm::install_args(&release, self.command_timeout))
                .await;
            self.record_outcome(instance_id, OP, &lease, outcome).await
        })
        .await
    }

    /// `helm dependency update` when the chart declares subcharts.
    async fn refresh_dependencies(&self, instance_id: &str) -> BrokerResult<Option<CommandOutcome>> {
        let chart = self.layout.chart_dir(instance_id);
        let manifest = self.files.read(&chart.join("Chart.yaml")).await?;
        if !manifest.as_deref().is_some_and(helm::declares_dependencies) {
            return Ok(None);
        }
        let outcome = self
            .executor
            .invoke(instance_id, &helm::dependency_update_args(&chart))
            .await;
        Ok(Some(outcome))
    }

    // ── update ────────────────────────────────────────────────────────────────

    async fn update(&self, instance_id: &str, requested: &InstanceDetails) -> BrokerResult<()> {
        const OP: Operation = Operation::Update;
        self.locked(instance_id, OP, |pre, lease| async move {
            if !pre.succeeded() {
                return self
                    .finish_instance(instance_id, LastOperation::failed(OP, hook_failure(OP, &pre)))
                    .await;
            }
            let mut instance: ServiceInstance = self.metadata.load(instance_id).await?;
            let target = match Target::of(&instance.details) {
                Ok(t) => t,
                Err(reason) => {
                    return self
                        .finish_instance(instance_id, LastOperation::failed(OP, reason))
                        .await;
                }
            };
            self.snapshot_instance(instance_id, OP, false).await?;

            if requested.plan_id != instance.details.plan_id {
                if let Err(reason) = self.replace_plan(instance_id, requested).await {
                    return self
                        .finish_instance(instance_id, LastOperation::failed(OP, reason))
                        .await;
                }
            }
            let custom_values = self.layout.custom_values_file(instance_id);
            if let Some(encoded) = requested.parameters.as_ref().and_then(|p| p.raw_values()) {
                let yaml = match decode_raw_values(encoded) {
                    Ok(yaml) => yaml,
                    Err(e) => {
                        return self
                            .finish_instance(instance_id, LastOperation::failed(OP, e.to_string()))
                            .await;
                    }
                };
                self.files.write_atomic(&custom_values, &yaml).await?;
            } else if self.files.remove_file(&custom_values).await? {
                tracing::info!(instance_id, "raw values cleared, overlay removed");
            }

            instance.details.plan_id.clone_from(&requested.plan_id);
            instance.details.parameters.clone_from(&requested.parameters);
            self.metadata.save(instance_id, &mut instance).await?;

            let chart = self.layout.chart_dir(instance_id);
            let values = self.values_files(instance_id).await?;
            let overrides = requested
                .parameters
                .as_ref()
                .map(broker_common::Parameters::set_overrides)
                .unwrap_or_default();
            let release = Release {
                name: &target.name,
                namespace: &target.namespace,
                chart: &chart,
                values: &values,
                overrides: &overrides,
            };
            let outcome = self
                .executor
                .invoke(instance_id, &helm::upgrade_args(&release, self.command_timeout))
                .await;
            self.record_outcome(instance_id, OP, &lease, outcome).await
        })
        .await
    }

    /// Swap the instance's plan directory for the requested plan's source.
    async fn replace_plan(&self, instance_id: &str, requested: &InstanceDetails) -> Result<(), String> {
        let catalog: Catalog = self
            .metadata
            .load("")
            .await
            .map_err(|e| format!("cannot read catalog: {e}"))?;
        let addon = catalog
            .find(&requested.service_id)
            .ok_or_else(|| format!("service '{}' is not in the catalog", requested.service_id))?;
        let plan = addon
            .plan(&requested.plan_id)
            .ok_or_else(|| format!("plan '{}' is not offered by '{}'", requested.plan_id, addon.name))?;
        self.files
            .copy_tree(&self.layout.addon_plan_dir(addon, plan), &self.layout.plan_dir(instance_id))
            .await
            .map_err(|e| format!("cannot switch to plan '{}': {e:#}", plan.name))?;
        tracing::info!(instance_id, plan = %plan.name, "plan replaced");
        Ok(())
    }

    // ── bind / unbind ─────────────────────────────────────────────────────────

    async fn bind(&self, instance_id: &str) -> BrokerResult<()> {
        const OP: Operation = Operation::Bind;
        self.locked(instance_id, OP, |pre, lease| async move {
            if !pre.succeeded() {
                return self
                    .finish_binding(instance_id, LastOperation::failed(OP, hook_failure(OP, &pre)), None)
                    .await;
            }
            let instance: ServiceInstance = self.metadata.load(instance_id).await?;
            let target = match Target::of(&instance.details) {
                Ok(t) => t,
                Err(reason) => {
                    return self
                        .finish_binding(instance_id, LastOperation::failed(OP, reason), None)
                        .await;
                }
            };
            if let Err(e) = self.savepoints.snapshot(instance_id, false).await {
                self.finish_binding(
                    instance_id,
                    LastOperation::failed(OP, format!("savepoint failed: {e:#}")),
                    None,
                )
                .await?;
                return Err(e);
            }

            let rendered = match self.render_bind_template(instance_id, &instance, &target).await? {
                Ok(rendered) => rendered,
                Err(reason) => {
                    return self
                        .finish_binding(instance_id, LastOperation::failed(OP, reason), None)
                        .await;
                }
            };
            let entries = match parse_bind_template(&rendered) {
                Ok(template) => template.credential,
                Err(e) => {
                    return self
                        .finish_binding(instance_id, LastOperation::failed(OP, e.to_string()), None)
                        .await;
                }
            };

            let (credentials, errors) = self.resolve_all(&target.namespace, &entries).await;
            let last_operation = if errors.is_empty() {
                LastOperation::succeeded(OP, format!("{} credentials issued", credentials.len()))
            } else {
                tracing::warn!(instance_id, failed = errors.len(), "credential resolution failed");
                LastOperation::failed(OP, errors.join("; "))
            };
            self.finish_binding(instance_id, under_lease(&lease, OP, last_operation), Some(credentials))
                .await
        })
        .await
    }

    /// Inject the plan's bind template, render, and always remove it again.
    /// The inner `Err(String)` is an execution failure to record.
    async fn render_bind_template(
        &self,
        instance_id: &str,
        instance: &ServiceInstance,
        target: &Target,
    ) -> BrokerResult<Result<String, String>> {
        let source = self.layout.plan_bind_template(instance_id);
        if !self.files.exists(&source).await? {
            return Ok(Err("plan has no bind.yaml binding template".to_string()));
        }
        let injected = self.layout.chart_bind_template(instance_id);
        if let Err(e) = self.files.copy_file(&source, &injected).await {
            return Ok(Err(format!("cannot inject binding template: {e:#}")));
        }

        let rendered = async {
            let chart = self.layout.chart_dir(instance_id);
            let values = self.values_files(instance_id).await?;
            let overrides = instance
                .details
                .parameters
                .as_ref()
                .map(broker_common::Parameters::set_overrides)
                .unwrap_or_default();
            let release = Release {
                name: &target.name,
                namespace: &target.namespace,
                chart: &chart,
                values: &values,
                overrides: &overrides,
            };
            let outcome = self
                .executor
                .invoke(instance_id, &helm::template_args(&release))
                .await;
            Ok::<_, BrokerError>(if outcome.success() {
                Ok(outcome.output)
            } else {
                Err(outcome.output)
            })
        }
        .await;

        self.remove_chart_bind_template(instance_id).await;
        rendered
    }

    /// Resolve every entry. Only resolved entries are returned as
    /// credentials; each failure contributes one error line.
    async fn resolve_all(
        &self,
        namespace: &str,
        entries: &[CredentialEntry],
    ) -> (BTreeMap<String, String>, Vec<String>) {
        let mut credentials = BTreeMap::new();
        let mut errors = Vec::new();
        for entry in entries {
            let outcome = self
                .executor
                .resolve_credential(namespace, &entry.source())
                .await;
            if outcome.success() {
                credentials.insert(entry.name.clone(), outcome.output);
            } else {
                errors.push(format!(
                    "{}: status {}: {}",
                    entry.name,
                    outcome.status,
                    outcome.output.trim()
                ));
            }
        }
        (credentials, errors)
    }

    async fn unbind(&self, instance_id: &str) -> BrokerResult<()> {
        const OP: Operation = Operation::Unbind;
        self.locked(instance_id, OP, |pre, lease| async move {
            if !pre.succeeded() {
                return self
                    .finish_binding(instance_id, LastOperation::failed(OP, hook_failure(OP, &pre)), None)
                    .await;
            }
            if let Err(e) = self.savepoints.snapshot(instance_id, false).await {
                self.finish_binding(
                    instance_id,
                    LastOperation::failed(OP, format!("savepoint failed: {e:#}")),
                    None,
                )
                .await?;
                return Err(e);
            }
            if lease.is_lost() {
                return self
                    .finish_binding(
                        instance_id,
                        LastOperation::failed(OP, "lock lease lost during unbind; binding kept"),
                        None,
                    )
                    .await;
            }
            self.metadata.delete::<Binding>(instance_id).await?;
            tracing::info!(instance_id, "binding removed");
            Ok(())
        })
        .await
    }

    // ── deprovision ───────────────────────────────────────────────────────────

    async fn deprovision(&self, instance_id: &str) -> BrokerResult<()> {
        const OP: Operation = Operation::Deprovision;
        self.locked(instance_id, OP, |pre, lease| async move {
            if !pre.succeeded() {
                return self
                    .finish_instance(instance_id, LastOperation::failed(OP, hook_failure(OP, &pre)))
                    .await;
            }
            let instance: ServiceInstance = self.metadata.load(instance_id).await?;
            let target = match Target::of(&instance.details) {
                Ok(t) => t,
                Err(reason) => {
                    return self
                        .finish_instance(instance_id, LastOperation::failed(OP, reason))
                        .await;
                }
            };
            self.snapshot_instance(instance_id, OP, true).await?;
            self.finish_instance(instance_id, LastOperation::in_progress(OP, "uninstalling"))
                .await?;

            let outcome = self
                .executor
                .invoke(
                    instance_id,
                    &helm::uninstall_args(&target.name, &target.namespace, self.command_timeout),
                )
                .await;
            self.record_outcome(instance_id, OP, &lease, outcome).await
        })
        .await
    }
}
