//! Command lines for the deployment tool.
//!
//! Builders return argument vectors; the caller prepends the binary and runs
//! them through a [`crate::application::ports::CommandRunner`]. No shell is
//! involved, so values are never quoted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// A release to install, upgrade or render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub chart: &'a Path,
    /// Values overlays in precedence order (later files win).
    pub values: &'a [PathBuf],
    /// `key=value` overrides applied after every values file.
    pub overrides: &'a [String],
}

impl Release<'_> {
    fn push_values(&self, args: &mut Vec<String>) {
        for file in self.values {
            args.push("-f".into());
            args.push(file.to_string_lossy().into_owned());
        }
        for set in self.overrides {
            args.push("--set".into());
            args.push(set.clone());
        }
    }
}

/// Go duration string accepted by `--timeout` (`1h30m0s`, `45s`).
#[must_use]
pub fn format_timeout(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

#[must_use]
pub fn install_args(release: &Release<'_>, timeout: Duration) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        release.name.to_string(),
        release.chart.to_string_lossy().into_owned(),
        "--namespace".into(),
        release.namespace.to_string(),
        "--create-namespace".into(),
        "--wait".into(),
        "--timeout".into(),
        format_timeout(timeout),
    ];
    release.push_values(&mut args);
    args
}

/// Upgrade in place, keeping values set by earlier installs and upgrades.
#[must_use]
pub fn upgrade_args(release: &Release<'_>, timeout: Duration) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        release.name.to_string(),
        release.chart.to_string_lossy().into_owned(),
        "--namespace".into(),
        release.namespace.to_string(),
        "--reuse-values".into(),
        "--wait".into(),
        "--timeout".into(),
        format_timeout(timeout),
    ];
    release.push_values(&mut args);
    args
}

/// Dry-run render used to read the binding template.
#[must_use]
pub fn template_args(release: &Release<'_>) -> Vec<String> {
    let mut args = vec![
        "template".to_string(),
        release.name.to_string(),
        release.chart.to_string_lossy().into_owned(),
        "--namespace".into(),
        release.namespace.to_string(),
    ];
    release.push_values(&mut args);
    args
}

#[must_use]
pub fn uninstall_args(name: &str, namespace: &str, timeout: Duration) -> Vec<String> {
    vec![
        "uninstall".to_string(),
        name.to_string(),
        "--namespace".into(),
        namespace.to_string(),
        "--wait".into(),
        "--timeout".into(),
        format_timeout(timeout),
    ]
}

#[must_use]
pub fn dependency_update_args(chart: &Path) -> Vec<String> {
    vec![
        "dependency".to_string(),
        "update".to_string(),
        chart.to_string_lossy().into_owned(),
    ]
}

#[derive(Deserialize)]
struct ChartManifest {
    #[serde(default)]
    dependencies: Option<Vec<serde_yaml::Value>>,
}

/// Whether a `Chart.yaml` declares subchart dependencies.
///
/// An unparseable manifest is treated as declaring none; the install that
/// follows reports the real problem.
#[must_use]
pub fn declares_dependencies(chart_yaml: &str) -> bool {
    serde_yaml::from_str::<ChartManifest>(chart_yaml)
        .ok()
        .and_then(|m| m.dependencies)
        .is_some_and(|deps| !deps.is_empty())
}
