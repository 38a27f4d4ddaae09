//! Infrastructure implementation of the `FileStore` port.
//!
//! Blocking filesystem work runs on `tokio::task::spawn_blocking`. Writes go
//! to a temp file in the target directory, are fsynced, then renamed over
//! the target so readers never observe a torn document.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::application::ports::FileStore;

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileStore;

impl LocalFileStore {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("filesystem task panicked")?
}

fn read_sync(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn write_atomic_sync(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?
        .to_string_lossy();
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let result = write_and_rename(&temp_path, path, contents);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    // Persist the rename itself.
    #[cfg(unix)]
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn write_and_rename(temp_path: &Path, path: &Path, contents: &str) -> Result<()> {
    let mut file = fs::File::create(temp_path)
        .with_context(|| format!("creating temp file {}", temp_path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    fs::rename(temp_path, path).with_context(|| format!("finalizing {}", path.display()))
}

fn remove_file_sync(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

fn copy_file_sync(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating directory {}", parent.display()))?;
    }
    fs::copy(from, to)
        .with_context(|| format!("copying {} to {}", from.display(), to.display()))?;
    Ok(())
}

fn copy_tree_sync(from: &Path, to: &Path) -> Result<()> {
    if !from.is_dir() {
        anyhow::bail!("{} is not a directory", from.display());
    }
    remove_tree_sync(to)?;
    copy_dir_recursive(from, to)
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("creating directory {}", to.display()))?;
    for entry in fs::read_dir(from).with_context(|| format!("listing {}", from.display()))? {
        let entry = entry.with_context(|| format!("listing {}", from.display()))?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if src.is_dir() {
            copy_dir_recursive(&src, &dst)?;
        } else {
            fs::copy(&src, &dst)
                .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
        }
    }
    Ok(())
}

fn remove_tree_sync(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

fn list_dirs_sync(path: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("listing {}", path.display())),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", path.display()))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn unpack_tgz_sync(archive: &[u8], dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("creating directory {}", dest.display()))?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(Cursor::new(archive)));
    tar.unpack(dest)
        .with_context(|| format!("unpacking archive into {}", dest.display()))
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn read(&self, path: &Path) -> Result<Option<String>> {
        let path = path.to_path_buf();
        blocking(move || read_sync(&path)).await
    }

    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<()> {
        let path = path.to_path_buf();
        let contents = contents.to_string();
        blocking(move || write_atomic_sync(&path, &contents)).await
    }

    async fn remove_file(&self, path: &Path) -> Result<bool> {
        let path = path.to_path_buf();
        blocking(move || remove_file_sync(&path)).await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = path.to_path_buf();
        blocking(move || {
            path.try_exists()
                .with_context(|| format!("checking {}", path.display()))
        })
        .await
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        let (from, to) = (from.to_path_buf(), to.to_path_buf());
        blocking(move || copy_file_sync(&from, &to)).await
    }

    async fn copy_tree(&self, from: &Path, to: &Path) -> Result<()> {
        let (from, to) = (from.to_path_buf(), to.to_path_buf());
        blocking(move || copy_tree_sync(&from, &to)).await
    }

    async fn remove_tree(&self, path: &Path) -> Result<bool> {
        let path = path.to_path_buf();
        blocking(move || remove_tree_sync(&path)).await
    }

    async fn list_dirs(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let path = path.to_path_buf();
        blocking(move || list_dirs_sync(&path)).await
    }

    async fn unpack_tgz(&self, archive: Vec<u8>, dest: &Path) -> Result<()> {
        let dest = dest.to_path_buf();
        blocking(move || unpack_tgz_sync(&archive, &dest)).await
    }
}
