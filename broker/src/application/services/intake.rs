//! Lifecycle intake: synchronous validation, initial document writes and
//! enqueueing. Stands in for the platform-facing API layer.
//!
//! Check-then-write sequences take a short-lived `intake:<id>` lock so two
//! racing requests for one instance cannot both pass the existence check.
//! The colon keeps the key disjoint from instance ids.

use std::sync::Arc;

use broker_common::{
    Addon, Binding, Catalog, InstanceDetails, LastOperation, Operation, OperationState,
    Parameters, PendingOperation, ServiceInstance, TaskMessage, validate_instance_id,
};

use crate::application::ports::{FileStore, LockHandle, LockManager, TaskQueue};
use crate::application::services::metadata::MetadataStore;
use crate::domain::error::{BrokerError, BrokerResult};
use crate::domain::layout::Layout;
use crate::domain::validate::{decode_raw_values, verify};

/// A platform update request. Omitted fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateRequest {
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    pub parameters: Option<Parameters>,
}

pub struct Intake {
    metadata: Arc<MetadataStore>,
    locks: Arc<dyn LockManager>,
    queue: Arc<dyn TaskQueue>,
    files: Arc<dyn FileStore>,
    layout: Layout,
}

pub(crate) fn intake_key(instance_id: &str) -> String {
    format!("intake:{instance_id}")
}

/// Mapping lookup that also matches unquoted numeric keys such as `1.0`.
fn entry<'a>(map: &'a serde_yaml::Value, key: &str) -> Option<&'a serde_yaml::Value> {
    map.as_mapping()?.iter().find_map(|(k, v)| {
        let matches = match k {
            serde_yaml::Value::String(s) => s == key,
            serde_yaml::Value::Number(n) => n.to_string() == key,
            _ => false,
        };
        matches.then_some(v)
    })
}

fn new_task(operation: Operation, instance_id: &str) -> TaskMessage {
    TaskMessage::new(uuid::Uuid::new_v4().to_string(), operation, instance_id)
}

impl Intake {
    pub fn new(
        metadata: Arc<MetadataStore>,
        locks: Arc<dyn LockManager>,
        queue: Arc<dyn TaskQueue>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        let layout = metadata.layout().clone();
        Self {
            metadata,
            locks,
            queue,
            files,
            layout,
        }
    }

    async fn guard(&self, instance_id: &str) -> BrokerResult<LockHandle> {
        validate_instance_id(instance_id)
            .map_err(|reason| BrokerError::InvalidRequest(format!("instance id '{instance_id}': {reason}")))?;
        self.locks.acquire(&intake_key(instance_id)).await
    }

    async fn catalog(&self) -> BrokerResult<Catalog> {
        match self.metadata.load::<Catalog>("").await {
            Err(BrokerError::NotFound(_)) => Err(BrokerError::Unavailable(
                "addon catalog has not been loaded".into(),
            )),
            other => other,
        }
    }

    async fn submit(&self, task: &TaskMessage) -> BrokerResult<PendingOperation> {
        self.queue
            .enqueue(task)
            .await
            .map_err(|e| BrokerError::unavailable("enqueueing task", &e))?;
        tracing::info!(
            instance_id = %task.instance_id,
            operation = %task.operation,
            task_id = %task.task_id,
            "task enqueued"
        );
        Ok(task.pending())
    }

    async fn load_instance(&self, instance_id: &str) -> BrokerResult<ServiceInstance> {
        self.metadata
            .load(instance_id)
            .await
            .map_err(|e| match e {
                BrokerError::NotFound(_) => BrokerError::NotFound(format!("instance '{instance_id}'")),
                other => other,
            })
    }

    fn reject_in_flight(instance: &ServiceInstance) -> BrokerResult<()> {
        if instance.last_operation.is_in_progress() {
            return Err(BrokerError::Conflict(format!(
                "instance '{}' has a {} in progress",
                instance.id, instance.last_operation.operation
            )));
        }
        Ok(())
    }

    /// At most one operation per instance: neither the instance nor its
    /// binding may have one in flight.
    async fn reject_active(&self, instance: &ServiceInstance) -> BrokerResult<()> {
        Self::reject_in_flight(instance)?;
        if let Some(binding) = self.metadata.try_load::<Binding>(&instance.id).await? {
            if binding.last_operation.is_in_progress() {
                return Err(BrokerError::Conflict(format!(
                    "instance '{}' has a {} in progress",
                    instance.id, binding.last_operation.operation
                )));
            }
        }
        Ok(())
    }

    // ── provision ─────────────────────────────────────────────────────────────

    /// Accept a provision request.
    ///
    /// # Errors
    ///
    /// `Conflict` when the instance exists, `InvalidRequest` for unknown or
    /// archived services, missing context and parameter violations,
    /// `Unavailable` when the catalog or a substrate cannot be reached.
    pub async fn provision(&self, instance_id: &str, details: InstanceDetails) -> BrokerResult<PendingOperation> {
        let mut guard = self.guard(instance_id).await?;
        let result = self.provision_locked(instance_id, details).await;
        guard.release().await;
        result
    }

    async fn provision_locked(&self, instance_id: &str, details: InstanceDetails) -> BrokerResult<PendingOperation> {
        if self.metadata.exists::<ServiceInstance>(instance_id).await? {
            return Err(BrokerError::Conflict(format!("instance '{instance_id}' already exists")));
        }
        let catalog = self.catalog().await?;
        let addon = catalog.find(&details.service_id).ok_or_else(|| {
            BrokerError::InvalidRequest(format!("unknown service '{}'", details.service_id))
        })?;
        if addon.archive {
            return Err(BrokerError::InvalidRequest(format!(
                "service '{}' is archived",
                addon.name
            )));
        }
        let plan = addon.plan(&details.plan_id).ok_or_else(|| {
            BrokerError::InvalidRequest(format!(
                "plan '{}' is not offered by '{}'",
                details.plan_id, addon.name
            ))
        })?;
        for key in ["instance_name", "namespace"] {
            if details.context_str(key).is_none_or(str::is_empty) {
                return Err(BrokerError::InvalidRequest(format!("context.{key} is required")));
            }
        }
        let parameters = details.parameters.clone().unwrap_or_default();
        verify(&addon.allow_parameters, &parameters)?.into_result()?;
        let raw_values = parameters.raw_values().map(decode_raw_values).transpose()?;

        self.files
            .copy_tree(&self.layout.addon_chart_dir(addon), &self.layout.chart_dir(instance_id))
            .await?;
        self.files
            .copy_tree(&self.layout.addon_plan_dir(addon, plan), &self.layout.plan_dir(instance_id))
            .await?;
        self.write_addon_values(instance_id, addon).await?;
        if let Some(yaml) = raw_values {
            self.files
                .write_atomic(&self.layout.custom_values_file(instance_id), &yaml)
                .await?;
        }

        let mut instance = ServiceInstance::new(
            instance_id,
            details,
            LastOperation::in_progress(Operation::Provision, "provision accepted"),
        );
        self.metadata.save(instance_id, &mut instance).await?;

        let task = new_task(Operation::Provision, instance_id);
        match self.submit(&task).await {
            Ok(pending) => Ok(pending),
            Err(e) => {
                self.metadata.delete::<ServiceInstance>(instance_id).await?;
                Err(e)
            }
        }
    }

    /// Write the operator defaults for this addon version, if configured.
    async fn write_addon_values(&self, instance_id: &str, addon: &Addon) -> BrokerResult<()> {
        let Some(config) = self.files.read(&self.layout.addon_values_config()).await? else {
            return Ok(());
        };
        let all: serde_yaml::Value = serde_yaml::from_str(&config)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", self.layout.addon_values_config().display()))?;
        let Some(values) = entry(&all, &addon.name)
            .and_then(|versions| entry(versions, &addon.version))
            .filter(|v| !v.is_null())
        else {
            return Ok(());
        };
        let yaml = serde_yaml::to_string(values).map_err(anyhow::Error::from)?;
        self.files
            .write_atomic(&self.layout.addon_values_file(instance_id), &yaml)
            .await?;
        Ok(())
    }

    // ── update ────────────────────────────────────────────────────────────────

    /// Accept an update. Parameters are merged over the current ones and
    /// the merged set is validated.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Conflict` while an operation is in flight,
    /// `InvalidRequest` when the addon is not updateable or parameters fail
    /// validation.
    pub async fn update(&self, instance_id: &str, request: UpdateRequest) -> BrokerResult<PendingOperation> {
        let mut guard = self.guard(instance_id).await?;
        let result = self.update_locked(instance_id, request).await;
        guard.release().await;
        result
    }

    async fn update_locked(&self, instance_id: &str, request: UpdateRequest) -> BrokerResult<PendingOperation> {
        let instance = self.load_instance(instance_id).await?;
        self.reject_active(&instance).await?;
        let current = &instance.details;
        if let Some(service_id) = &request.service_id {
            if *service_id != current.service_id {
                return Err(BrokerError::InvalidRequest(format!(
                    "instance '{instance_id}' belongs to service '{}', not '{service_id}'",
                    current.service_id
                )));
            }
        }
        let catalog = self.catalog().await?;
        let addon = catalog.find(&current.service_id).ok_or_else(|| {
            BrokerError::InvalidRequest(format!("unknown service '{}'", current.service_id))
        })?;
        if !addon.plan_updateable {
            return Err(BrokerError::InvalidRequest(format!(
                "service '{}' does not support updates",
                addon.name
            )));
        }
        let plan_id = request.plan_id.unwrap_or_else(|| current.plan_id.clone());
        if addon.plan(&plan_id).is_none() {
            return Err(BrokerError::InvalidRequest(format!(
                "plan '{plan_id}' is not offered by '{}'",
                addon.name
            )));
        }

        let existing = current.parameters.clone().unwrap_or_default();
        let merged = match &request.parameters {
            Some(update) => existing.merged(update),
            None => existing,
        };
        verify(&addon.allow_parameters, &merged)?.into_result()?;
        if let Some(encoded) = merged.raw_values() {
            decode_raw_values(encoded)?;
        }

        let details = InstanceDetails {
            service_id: current.service_id.clone(),
            plan_id,
            context: current.context.clone(),
            parameters: (!merged.is_empty()).then_some(merged),
        };
        self.mark_and_submit(instance, Operation::Update, Some(details)).await
    }

    /// Mark the instance in progress and enqueue; restore the previous
    /// status if the queue refuses the task.
    async fn mark_and_submit(
        &self,
        mut instance: ServiceInstance,
        operation: Operation,
        details: Option<InstanceDetails>,
    ) -> BrokerResult<PendingOperation> {
        let instance_id = instance.id.clone();
        let previous = std::mem::replace(
            &mut instance.last_operation,
            LastOperation::in_progress(operation, format!("{operation} accepted")),
        );
        self.metadata.save(&instance_id, &mut instance).await?;

        let mut task = new_task(operation, &instance_id);
        if let Some(details) = details {
            task = task.with_details(details);
        }
        match self.submit(&task).await {
            Ok(pending) => Ok(pending),
            Err(e) => {
                instance.last_operation = previous;
                self.metadata.save(&instance_id, &mut instance).await?;
                Err(e)
            }
        }
    }

    // ── bind / unbind ─────────────────────────────────────────────────────────

    /// Accept a bind request.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown instances, `InvalidRequest` when the addon is
    /// not bindable or the instance is not provisioned, `Conflict` when a
    /// binding exists or an operation is in flight.
    pub async fn bind(&self, instance_id: &str, binding_id: &str) -> BrokerResult<PendingOperation> {
        if binding_id.is_empty() {
            return Err(BrokerError::InvalidRequest("binding id is required".into()));
        }
        let mut guard = self.guard(instance_id).await?;
        let result = self.bind_locked(instance_id, binding_id).await;
        guard.release().await;
        result
    }

    async fn bind_locked(&self, instance_id: &str, binding_id: &str) -> BrokerResult<PendingOperation> {
        let instance = self.load_instance(instance_id).await?;
        let catalog = self.catalog().await?;
        let addon = catalog.find(&instance.details.service_id).ok_or_else(|| {
            BrokerError::InvalidRequest(format!("unknown service '{}'", instance.details.service_id))
        })?;
        if !addon.bindable {
            return Err(BrokerError::InvalidRequest(format!(
                "service '{}' is not bindable",
                addon.name
            )));
        }
        Self::reject_in_flight(&instance)?;
        if instance.last_operation.state != OperationState::Succeeded
            || instance.last_operation.operation == Operation::Deprovision
        {
            return Err(BrokerError::InvalidRequest(format!(
                "instance '{instance_id}' is not provisioned (last {} {:?})",
                instance.last_operation.operation, instance.last_operation.state
            )));
        }
        if self.metadata.exists::<Binding>(instance_id).await? {
            return Err(BrokerError::Conflict(format!(
                "instance '{instance_id}' already has a binding"
            )));
        }

        let mut binding = Binding::new(
            instance_id,
            binding_id,
            LastOperation::in_progress(Operation::Bind, "bind accepted"),
        );
        self.metadata.save(instance_id, &mut binding).await?;

        let task = new_task(Operation::Bind, instance_id).with_binding(binding_id);
        match self.submit(&task).await {
            Ok(pending) => Ok(pending),
            Err(e) => {
                self.metadata.delete::<Binding>(instance_id).await?;
                Err(e)
            }
        }
    }

    async fn load_binding(&self, instance_id: &str, binding_id: Option<&str>) -> BrokerResult<Binding> {
        let binding: Binding = self
            .metadata
            .try_load(instance_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("binding for instance '{instance_id}'")))?;
        if let Some(expected) = binding_id {
            if binding.binding_id != expected {
                return Err(BrokerError::NotFound(format!(
                    "binding '{expected}' for instance '{instance_id}'"
                )));
            }
        }
        Ok(binding)
    }

    /// Accept an unbind request.
    ///
    /// # Errors
    ///
    /// `NotFound` when the binding does not exist, `Conflict` while a bind
    /// or unbind is in flight.
    pub async fn unbind(&self, instance_id: &str, binding_id: &str) -> BrokerResult<PendingOperation> {
        let mut guard = self.guard(instance_id).await?;
        let result = self.unbind_locked(instance_id, binding_id).await;
        guard.release().await;
        result
    }

    async fn unbind_locked(&self, instance_id: &str, binding_id: &str) -> BrokerResult<PendingOperation> {
        let mut binding = self.load_binding(instance_id, Some(binding_id)).await?;
        Self::reject_in_flight(&self.load_instance(instance_id).await?)?;
        if binding.last_operation.is_in_progress() {
            return Err(BrokerError::Conflict(format!(
                "binding '{binding_id}' has a {} in progress",
                binding.last_operation.operation
            )));
        }
        let previous = std::mem::replace(
            &mut binding.last_operation,
            LastOperation::in_progress(Operation::Unbind, "unbind accepted"),
        );
        self.metadata.save(instance_id, &mut binding).await?;

        let task = new_task(Operation::Unbind, instance_id).with_binding(binding_id);
        match self.submit(&task).await {
            Ok(pending) => Ok(pending),
            Err(e) => {
                binding.last_operation = previous;
                self.metadata.save(instance_id, &mut binding).await?;
                Err(e)
            }
        }
    }

    // ── deprovision ───────────────────────────────────────────────────────────

    /// Accept a deprovision request. Routed to the low-priority queue.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or already removed instances, `Conflict`
    /// while another operation is in flight.
    pub async fn deprovision(&self, instance_id: &str) -> BrokerResult<PendingOperation> {
        let mut guard = self.guard(instance_id).await?;
        let result = self.deprovision_locked(instance_id).await;
        guard.release().await;
        result
    }

    async fn deprovision_locked(&self, instance_id: &str) -> BrokerResult<PendingOperation> {
        let instance = self.load_instance(instance_id).await?;
        if instance.last_operation.operation == Operation::Deprovision
            && instance.last_operation.state == OperationState::Succeeded
        {
            return Err(BrokerError::NotFound(format!(
                "instance '{instance_id}' is already deprovisioned"
            )));
        }
        self.reject_active(&instance).await?;
        self.mark_and_submit(instance, Operation::Deprovision, None).await
    }

    // ── reads ─────────────────────────────────────────────────────────────────

    /// Poll an instance operation. A pure read.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown instances.
    pub async fn get_operation(&self, instance_id: &str) -> BrokerResult<LastOperation> {
        Ok(self.load_instance(instance_id).await?.last_operation)
    }

    /// Poll a binding operation. A pure read.
    ///
    /// # Errors
    ///
    /// `NotFound` when no binding exists.
    pub async fn get_binding_operation(&self, instance_id: &str) -> BrokerResult<LastOperation> {
        Ok(self.load_binding(instance_id, None).await?.last_operation)
    }

    /// Credentials of a succeeded binding.
    ///
    /// # Errors
    ///
    /// `NotFound` when no binding exists, `Conflict` when it has not
    /// succeeded.
    pub async fn get_binding(&self, instance_id: &str) -> BrokerResult<Binding> {
        let binding = self.load_binding(instance_id, None).await?;
        if binding.last_operation.state != OperationState::Succeeded {
            return Err(BrokerError::Conflict(format!(
                "binding for instance '{instance_id}' is {:?}",
                binding.last_operation.state
            )));
        }
        Ok(binding)
    }
}
