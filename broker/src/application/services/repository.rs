//! Mirrors a remote addon repository into the addons root.
//!
//! The repository publishes an index (`entries: {name: [{version}]}`) next
//! to one `<name>-<version>.tgz` per addon version. Each archive unpacks
//! into `addons/<name>-<version>/`. The index is saved last, so a sync cut
//! short is retried in full next time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::application::ports::{ChartRepository, FileStore};
use crate::domain::error::{BrokerError, BrokerResult};
use crate::domain::layout::Layout;

#[derive(Debug, Deserialize)]
struct RepositoryIndex {
    #[serde(default)]
    entries: BTreeMap<String, Vec<IndexEntry>>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    version: Version,
}

/// Index versions are usually quoted, but `version: 1.0` parses as a number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Version {
    Text(String),
    Number(serde_yaml::Number),
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Text(s) => f.write_str(s),
            Version::Number(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RepositoryEntry {
    url: String,
}

pub struct RepositorySync {
    repository: Arc<dyn ChartRepository>,
    files: Arc<dyn FileStore>,
    layout: Layout,
}

impl RepositorySync {
    pub fn new(repository: Arc<dyn ChartRepository>, files: Arc<dyn FileStore>, layout: Layout) -> Self {
        Self {
            repository,
            files,
            layout,
        }
    }

    /// Index URL of the first repository in `config/repositories`, `None`
    /// when the file is absent or lists nothing.
    ///
    /// # Errors
    ///
    /// `Schema` when the file is not a list of `{url}` entries.
    pub async fn configured_url(&self) -> BrokerResult<Option<String>> {
        let path = self.layout.repositories_config();
        let Some(text) = self.files.read(&path).await? else {
            return Ok(None);
        };
        let entries: Option<Vec<RepositoryEntry>> =
            serde_yaml::from_str(&text).map_err(|e| BrokerError::Schema {
                kind: "repositories",
                reason: format!("{}: {e}", path.display()),
            })?;
        Ok(entries.unwrap_or_default().into_iter().next().map(|r| r.url))
    }

    /// Replace the addons root with the contents of the repository whose
    /// index lives at `index_url`. Returns `false` when the saved index is
    /// already identical and nothing was downloaded.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a URL without an index file name, `Unavailable`
    /// when the repository cannot be read, `Schema` for a malformed index.
    pub async fn sync(&self, index_url: &str) -> BrokerResult<bool> {
        let (base, index_name) = index_url
            .rsplit_once('/')
            .filter(|(_, name)| is_plain_name(name))
            .ok_or_else(|| {
                BrokerError::InvalidRequest(format!("repository url {index_url} names no index file"))
            })?;

        let bytes = self.fetch(index_url).await?;
        let remote = String::from_utf8(bytes).map_err(|e| index_error(index_url, &e))?;
        let root = self.layout.addons_root();
        let local_index = root.join(index_name);
        if self.files.read(&local_index).await?.as_deref() == Some(remote.as_str()) {
            tracing::info!(url = index_url, "repository index unchanged");
            return Ok(false);
        }

        let index: RepositoryIndex = serde_yaml::from_str(&remote).map_err(|e| index_error(index_url, &e))?;
        let mut packages = Vec::new();
        for (name, versions) in &index.entries {
            for entry in versions {
                let package = format!("{name}-{}", entry.version);
                if !is_plain_name(&package) {
                    return Err(index_error(index_url, &format!("unusable entry {package:?}")));
                }
                packages.push(package);
            }
        }

        self.files.remove_tree(&root).await?;
        for package in &packages {
            let archive = self.fetch(&format!("{base}/{package}.tgz")).await?;
            self.files.unpack_tgz(archive, &root.join(package)).await?;
            tracing::info!(addon = %package, "addon downloaded");
        }
        self.files.write_atomic(&local_index, &remote).await?;
        tracing::info!(url = index_url, addons = packages.len(), "repository mirrored");
        Ok(true)
    }

    async fn fetch(&self, url: &str) -> BrokerResult<Vec<u8>> {
        self.repository
            .fetch(url)
            .await
            .map_err(|e| BrokerError::unavailable(&format!("fetching {url}"), &e))
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\'])
}

fn index_error(url: &str, reason: &dyn fmt::Display) -> BrokerError {
    BrokerError::Schema {
        kind: "repository index",
        reason: format!("{url}: {reason}"),
    }
}
