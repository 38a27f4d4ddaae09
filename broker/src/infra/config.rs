//! Configuration loading from `HELMBROKER_*` environment variables.

use anyhow::{Context, Result};

use crate::domain::config::{BrokerConfig, ENV_PREFIX};

/// Fallback for `HELMBROKER_WORKER_NAME`; set per pod by Kubernetes.
const HOSTNAME_VAR: &str = "HOSTNAME";

/// Load and validate the broker configuration from the process environment.
///
/// # Errors
///
/// Returns an error naming the prefix when a variable cannot be parsed or a
/// value fails validation.
pub fn load() -> Result<BrokerConfig> {
    from_iter(std::env::vars())
}

/// Load from an explicit variable set.
///
/// # Errors
///
/// See [`load`].
pub fn from_iter<I>(vars: I) -> Result<BrokerConfig>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut vars: Vec<(String, String)> = vars.into_iter().collect();
    let worker_name_var = format!("{ENV_PREFIX}WORKER_NAME");
    if !vars.iter().any(|(k, _)| *k == worker_name_var) {
        if let Some((_, host)) = vars.iter().find(|(k, v)| k == HOSTNAME_VAR && !v.is_empty()) {
            let host = host.clone();
            vars.push((worker_name_var, host));
        }
    }
    let config: BrokerConfig = envy::prefixed(ENV_PREFIX)
        .from_iter(vars)
        .with_context(|| format!("failed to load config from {ENV_PREFIX}* env vars"))?;
    config
        .validate()
        .with_context(|| format!("invalid {ENV_PREFIX}* configuration"))?;
    Ok(config)
}
