use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::params::Parameters;

/// Lifecycle verb. Doubles as the hook stage name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Provision,
    Update,
    Bind,
    Unbind,
    Deprovision,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Provision,
        Operation::Update,
        Operation::Bind,
        Operation::Unbind,
        Operation::Deprovision,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Provision => "provision",
            Operation::Update => "update",
            Operation::Bind => "bind",
            Operation::Unbind => "unbind",
            Operation::Deprovision => "deprovision",
        }
    }

    /// Whether the operation acts on the binding document.
    #[must_use]
    pub fn is_binding(self) -> bool {
        matches!(self, Operation::Bind | Operation::Unbind)
    }

    /// Queue class the task is routed to. Teardown never delays provisioning.
    #[must_use]
    pub fn priority(self) -> Priority {
        match self {
            Operation::Deprovision => Priority::Low,
            _ => Priority::High,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown operation '{0}': expected one of provision, update, bind, unbind, deprovision")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Low,
}

/// Status of the last submitted operation, as polled by the platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastOperation {
    pub operation: Operation,
    pub state: OperationState,
    #[serde(default)]
    pub description: String,
}

impl LastOperation {
    pub fn in_progress(operation: Operation, description: impl Into<String>) -> Self {
        Self {
            operation,
            state: OperationState::InProgress,
            description: description.into(),
        }
    }

    pub fn succeeded(operation: Operation, description: impl Into<String>) -> Self {
        Self {
            operation,
            state: OperationState::Succeeded,
            description: description.into(),
        }
    }

    pub fn failed(operation: Operation, description: impl Into<String>) -> Self {
        Self {
            operation,
            state: OperationState::Failed,
            description: description.into(),
        }
    }

    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.state == OperationState::InProgress
    }
}

/// The last accepted provision/update request for an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceDetails {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub parameters: Option<Parameters>,
}

impl InstanceDetails {
    /// String value of a context entry, if present and a string.
    #[must_use]
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    /// Release name handed to the deployment tool.
    #[must_use]
    pub fn instance_name(&self) -> Option<&str> {
        self.context_str("instance_name")
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.context_str("namespace")
    }
}

/// One provisioned instance, persisted as `instance.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    pub id: String,
    pub details: InstanceDetails,
    pub last_operation: LastOperation,
    pub last_modified_time: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, details: InstanceDetails, last_operation: LastOperation) -> Self {
        Self {
            id: id.into(),
            details,
            last_operation,
            last_modified_time: Utc::now(),
        }
    }
}

/// Issued credentials for an instance, persisted as `binding.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Binding {
    /// Instance id; bindings are keyed by the instance they belong to.
    pub id: String,
    pub binding_id: String,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    pub last_operation: LastOperation,
    pub last_modified_time: DateTime<Utc>,
}

impl Binding {
    pub fn new(
        instance_id: impl Into<String>,
        binding_id: impl Into<String>,
        last_operation: LastOperation,
    ) -> Self {
        Self {
            id: instance_id.into(),
            binding_id: binding_id.into(),
            credentials: BTreeMap::new(),
            last_operation,
            last_modified_time: Utc::now(),
        }
    }
}

/// A parameter an addon author allows callers to set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowParameter {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Catalog entry. Read-only to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Addon {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plan_updateable: bool,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub allow_parameters: Vec<AllowParameter>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Addon {
    #[must_use]
    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    /// Directory name of the addon under the addons root (`<name>-<version>`).
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// The full addon catalog, keyed by display name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Catalog {
    pub addons: BTreeMap<String, Addon>,
}

impl Catalog {
    /// Look up an addon by its service id.
    #[must_use]
    pub fn find(&self, service_id: &str) -> Option<&Addon> {
        self.addons.values().find(|a| a.id == service_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Pre,
    Post,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookPhase::Pre => "pre",
            HookPhase::Post => "post",
        })
    }
}

/// Outcome of a single hook script. `script_path` is `None` when no script
/// was installed for the phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HookRecord {
    pub phase: HookPhase,
    pub script_path: Option<String>,
    pub exit_status: i32,
    #[serde(default)]
    pub output: String,
}

impl HookRecord {
    #[must_use]
    pub fn absent(phase: HookPhase) -> Self {
        Self {
            phase,
            script_path: None,
            exit_status: 0,
            output: String::new(),
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

/// Pre/post hook outcomes of one lifecycle stage, persisted for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookResult {
    pub instance_id: String,
    pub stage: Operation,
    pub records: Vec<HookRecord>,
    pub last_modified_time: DateTime<Utc>,
}

/// A lifecycle task as carried by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub task_id: String,
    pub operation: Operation,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<InstanceDetails>,
    pub enqueued_at: DateTime<Utc>,
    /// Deliveries so far that failed on an unavailable substrate.
    #[serde(default)]
    pub attempts: u32,
}

impl TaskMessage {
    pub fn new(task_id: impl Into<String>, operation: Operation, instance_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            operation,
            instance_id: instance_id.into(),
            binding_id: None,
            details: None,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    #[must_use]
    pub fn with_binding(mut self, binding_id: impl Into<String>) -> Self {
        self.binding_id = Some(binding_id.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: InstanceDetails) -> Self {
        self.details = Some(details);
        self
    }

    /// The handle reported back to the submitter.
    #[must_use]
    pub fn pending(&self) -> PendingOperation {
        PendingOperation {
            task_id: self.task_id.clone(),
            instance_id: self.instance_id.clone(),
            operation: self.operation,
        }
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.operation.priority()
    }
}

/// Handle returned to the caller when a request is accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingOperation {
    pub task_id: String,
    pub instance_id: String,
    pub operation: Operation,
}
