use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs;

/// One top-level entry of the shared directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedEntry {
    pub name: String,
    /// Path relative to the shared root, `/`-separated.
    pub relative_path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Filesystem boundary used by the transfer layer.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create (or truncate) the destination file for an incoming transfer.
    async fn open_destination(&self, file_name: &str) -> Result<(fs::File, PathBuf)>;

    /// Resolve a peer-supplied relative path against the shared root.
    ///
    /// Returns `Ok(None)` when the target does not exist or is not a regular
    /// file, and an error when the path would escape the root.
    async fn resolve_shared(&self, relative_path: &str) -> Result<Option<PathBuf>>;

    /// List the regular files at the top level of the shared root.
    async fn list_shared(&self) -> Result<Vec<SharedEntry>>;

    fn set_shared_dir(&self, path: PathBuf);

    fn shared_dir(&self) -> PathBuf;
}

/// Local filesystem-based storage implementation.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    received_dir: PathBuf,
    shared_dir: Arc<RwLock<PathBuf>>,
}

impl LocalStorage {
    pub fn new(received_dir: PathBuf, shared_dir: PathBuf) -> Self {
        Self {
            received_dir,
            shared_dir: Arc::new(RwLock::new(shared_dir)),
        }
    }

    pub fn received_dir(&self) -> &Path {
        &self.received_dir
    }
}

/// Reduce a peer-supplied file name to a single safe path component.
fn destination_name(file_name: &str) -> Option<&str> {
    let name = Path::new(file_name).file_name()?.to_str()?;
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name)
}

/// Reject anything but plain relative components.
fn is_contained(relative_path: &str) -> bool {
    let path = Path::new(relative_path);
    !relative_path.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[async_trait]
impl Storage for LocalStorage {
    async fn open_destination(&self, file_name: &str) -> Result<(fs::File, PathBuf)> {
        let name = destination_name(file_name)
            .with_context(|| format!("Invalid destination file name: {:?}", file_name))?;

        fs::create_dir_all(&self.received_dir).await
            .context("Failed to create received files directory")?;

        let path = self.received_dir.join(name);
        let file = fs::File::create(&path).await
            .with_context(|| format!("Failed to create {}", path.display()))?;

        tracing::debug!("Opened destination {}", path.display());
        Ok((file, path))
    }

    async fn resolve_shared(&self, relative_path: &str) -> Result<Option<PathBuf>> {
        if !is_contained(relative_path) {
            anyhow::bail!("Shared path escapes the shared root: {:?}", relative_path);
        }

        let root = self.shared_dir();
        let root = match fs::canonicalize(&root).await {
            Ok(root) => root,
            Err(_) => return Ok(None),
        };

        let target = match fs::canonicalize(root.join(relative_path)).await {
            Ok(target) => target,
            Err(_) => return Ok(None),
        };

        // Symlinks inside the root may still point outside of it.
        if !target.starts_with(&root) {
            anyhow::bail!("Shared path escapes the shared root: {:?}", relative_path);
        }

        let meta = fs::metadata(&target).await
            .with_context(|| format!("Failed to stat {}", target.display()))?;
        if !meta.is_file() {
            return Ok(None);
        }

        Ok(Some(target))
    }

    async fn list_shared(&self) -> Result<Vec<SharedEntry>> {
        let root = self.shared_dir();
        fs::create_dir_all(&root).await
            .context("Failed to create shared files directory")?;

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&root).await
            .with_context(|| format!("Failed to list {}", root.display()))?;

        while let Some(entry) = dir.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::debug!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            if !meta.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            entries.push(SharedEntry {
                relative_path: name.clone(),
                name,
                size: meta.len(),
                is_dir: false,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!("Listed {} shared files in {}", entries.len(), root.display());
        Ok(entries)
    }

    fn set_shared_dir(&self, path: PathBuf) {
        let mut guard = self.shared_dir.write().unwrap_or_else(|e| e.into_inner());
        *guard = path;
    }

    fn shared_dir(&self) -> PathBuf {
        self.shared_dir.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
