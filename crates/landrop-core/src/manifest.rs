use anyhow::{Context, Result};
use storage::Storage;

use crate::model::SharedFile;
use crate::wire::encode_shared_files;

/// Snapshot of the shared folder as advertised in discovery datagrams.
///
/// The JSON form is computed once per scan; broadcasters only read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedManifest {
    files: Vec<SharedFile>,
    json: String,
}

impl Default for SharedManifest {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            json: "[]".to_string(),
        }
    }
}

impl SharedManifest {
    pub fn from_files(files: Vec<SharedFile>) -> Self {
        let json = encode_shared_files(&files);
        Self { files, json }
    }

    /// Build a manifest by listing the shared root of `storage`.
    pub async fn scan<S>(storage: &S) -> Result<Self>
    where
        S: Storage + ?Sized,
    {
        let entries = storage
            .list_shared()
            .await
            .context("Failed to scan shared folder")?;

        Ok(Self::from_files(entries.into_iter().map(SharedFile::from).collect()))
    }

    pub fn files(&self) -> &[SharedFile] {
        &self.files
    }

    pub fn json(&self) -> &str {
        &self.json
    }

    /// One-line description for `landrop info`.
    pub fn summary(&self) -> String {
        let total: u64 = self.files.iter().map(|f| f.size).sum();
        format!("{} shared files ({} bytes)", self.files.len(), total)
    }
}
