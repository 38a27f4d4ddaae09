//! On-disk layout of the broker root.
//!
//! Pure path arithmetic; nothing here touches the filesystem.

use std::path::{Path, PathBuf};

use broker_common::{Addon, HookPhase, Operation, Plan};

pub const INSTANCE_FILE: &str = "instance.json";
pub const BINDING_FILE: &str = "binding.json";
pub const HOOKS_RESULT_FILE: &str = "hooks-result.json";
pub const ADDON_VALUES_FILE: &str = "addon-values.yaml";
pub const CUSTOM_VALUES_FILE: &str = "custom-addon-values.yaml";
pub const BIND_TEMPLATE_FILE: &str = "bind.yaml";
pub const CATALOG_FILE: &str = "addons.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── Catalog ──────────────────────────────────────────────────────────────

    #[must_use]
    pub fn addons_root(&self) -> PathBuf {
        self.root.join("addons")
    }

    #[must_use]
    pub fn catalog_file(&self) -> PathBuf {
        self.addons_root().join(CATALOG_FILE)
    }

    #[must_use]
    pub fn addon_chart_dir(&self, addon: &Addon) -> PathBuf {
        self.addons_root()
            .join(addon.dir_name())
            .join("chart")
            .join(&addon.name)
    }

    #[must_use]
    pub fn addon_plan_dir(&self, addon: &Addon, plan: &Plan) -> PathBuf {
        self.addons_root()
            .join(addon.dir_name())
            .join("plans")
            .join(&plan.name)
    }

    /// YAML list of addon repositories; the first entry's `url` is mirrored.
    #[must_use]
    pub fn repositories_config(&self) -> PathBuf {
        self.root.join("config").join("repositories")
    }

    /// Operator-supplied default values, keyed by addon name then version.
    #[must_use]
    pub fn addon_values_config(&self) -> PathBuf {
        self.root.join("config").join("addon-values")
    }

    // ── Instances ────────────────────────────────────────────────────────────

    #[must_use]
    pub fn instances_root(&self) -> PathBuf {
        self.root.join("instances")
    }

    #[must_use]
    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.instances_root().join(instance_id)
    }

    #[must_use]
    pub fn instance_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join(INSTANCE_FILE)
    }

    #[must_use]
    pub fn binding_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join(BINDING_FILE)
    }

    #[must_use]
    pub fn hooks_result_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join(HOOKS_RESULT_FILE)
    }

    #[must_use]
    pub fn chart_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("chart")
    }

    #[must_use]
    pub fn plan_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("plan")
    }

    #[must_use]
    pub fn plan_values_file(&self, instance_id: &str) -> PathBuf {
        self.plan_dir(instance_id).join("values.yaml")
    }

    #[must_use]
    pub fn plan_bind_template(&self, instance_id: &str) -> PathBuf {
        self.plan_dir(instance_id).join(BIND_TEMPLATE_FILE)
    }

    /// Where the binding template is injected for a dry-run render.
    #[must_use]
    pub fn chart_bind_template(&self, instance_id: &str) -> PathBuf {
        self.chart_dir(instance_id)
            .join("templates")
            .join(BIND_TEMPLATE_FILE)
    }

    #[must_use]
    pub fn hooks_dir(&self, instance_id: &str) -> PathBuf {
        self.plan_dir(instance_id).join("hooks")
    }

    /// `plan/hooks/<phase>-<stage>.sh`
    #[must_use]
    pub fn hook_script(&self, instance_id: &str, stage: Operation, phase: HookPhase) -> PathBuf {
        self.hooks_dir(instance_id)
            .join(format!("{phase}-{stage}.sh"))
    }

    #[must_use]
    pub fn backups_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("backups")
    }

    #[must_use]
    pub fn addon_values_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join(ADDON_VALUES_FILE)
    }

    #[must_use]
    pub fn custom_values_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join(CUSTOM_VALUES_FILE)
    }

    /// Per-instance home for the deployment tool's mutable state.
    #[must_use]
    pub fn helm_home(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join(".helm")
    }

    /// Environment that isolates the deployment tool's cache, config and
    /// registry state to one instance.
    #[must_use]
    pub fn helm_env(&self, instance_id: &str) -> Vec<(String, String)> {
        let home = self.helm_home(instance_id);
        let path = |p: PathBuf| p.to_string_lossy().into_owned();
        vec![
            ("HELM_CACHE_HOME".into(), path(home.join("cache"))),
            ("HELM_CONFIG_HOME".into(), path(home.join("config"))),
            ("HELM_DATA_HOME".into(), path(home.join("data"))),
            (
                "HELM_REGISTRY_CONFIG".into(),
                path(home.join("config").join("registry").join("config.json")),
            ),
            (
                "HELM_REPOSITORY_CACHE".into(),
                path(home.join("cache").join("repository")),
            ),
            (
                "HELM_REPOSITORY_CONFIG".into(),
                path(home.join("config").join("repositories.yaml")),
            ),
        ]
    }
}
