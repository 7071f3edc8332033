//! FileSystem trait abstraction for durable engine state.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in notesync-cli) - Uses tokio::fs
//!
//! Everything the engine persists (change log, clock, known devices, the
//! directory mirror) is small JSON documents, read and written whole through
//! [`read_json`] and [`write_json`].

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Corrupt file {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete a file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// Read and decode a JSON file. A missing file is `Ok(None)`.
pub async fn read_json<T, F>(fs: &F, path: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    F: FileSystem + ?Sized,
{
    let bytes = match fs.read(path).await {
        Ok(bytes) => bytes,
        Err(FsError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| FsError::Corrupt {
            path: path.to_string(),
            reason: e.to_string(),
        })
}

/// Encode `value` as pretty JSON and write it.
pub async fn write_json<T, F>(fs: &F, path: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
    F: FileSystem + ?Sized,
{
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| FsError::Io(e.to_string()))?;
    fs.write(path, &bytes).await
}

/// In-memory filesystem for testing
#[derive(Debug, Default)]
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files currently stored, for tests asserting on persistence.
    pub fn file_count(&self) -> usize {
        self.files.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self
            .dirs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path)
        {
            return Err(FsError::IsDirectory(path));
        }

        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }

        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path, content.to_vec());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        if !path.is_empty() && !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());

        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        let candidates = files
            .keys()
            .map(|p| (p, false))
            .chain(dirs.iter().map(|p| (p, true)));
        for (full, is_dir) in candidates {
            let Some(rest) = full.strip_prefix(&prefix) else {
                continue;
            };
            // Direct children only
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            if seen.insert(rest.to_string()) {
                entries.push(FileEntry {
                    name: rest.to_string(),
                    is_dir,
                });
            }
        }
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        if files.remove(&path).is_some() {
            return Ok(());
        }
        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }

        if let Some(parent) = Self::parent_path(&path) {
            Box::pin(self.mkdir(&parent)).await?;
        }

        self.dirs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path);
        Ok(())
    }
}

// Lets several engines in a test share one filesystem
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}
