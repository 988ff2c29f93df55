//! FileSystem trait abstraction for the file-system backing.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` - Uses tokio::fs with temp-file + rename for atomic replaces
//!
//! Paths are `/`-separated and relative to the implementation's base.

mod native;

pub use native::NativeFs;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

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

    /// Replace file contents atomically (creates parent directories if needed).
    ///
    /// Readers observe either the old or the new content, never a mix.
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Create a file that must not exist yet. The parent must exist.
    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Create a single directory that must not exist yet. The parent must exist.
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete a directory and everything beneath it
    async fn remove_dir_all(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
        }
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

    fn is_dir(&self, path: &str) -> bool {
        self.dirs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }

    fn is_file(&self, path: &str) -> bool {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }

    fn require_parent(&self, path: &str) -> Result<()> {
        match Self::parent_path(path) {
            Some(parent) if !self.is_dir(&parent) => {
                if self.is_file(&parent) {
                    Err(FsError::NotDirectory(parent))
                } else {
                    Err(FsError::NotFound(parent))
                }
            }
            _ => Ok(()),
        }
    }

    /// Whether `candidate` lies strictly beneath `dir`.
    fn is_beneath(candidate: &str, dir: &str) -> bool {
        if dir.is_empty() {
            !candidate.is_empty()
        } else {
            candidate
                .strip_prefix(dir)
                .is_some_and(|rest| rest.starts_with('/'))
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        if self.is_dir(&path) {
            return Err(FsError::IsDirectory(path));
        }
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.is_dir(&path) {
            return Err(FsError::IsDirectory(path));
        }

        // Create parent directories
        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }

        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        self.require_parent(&path)?;
        if self.is_dir(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        if files.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        self.require_parent(&path)?;
        if self.is_file(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        if !dirs.insert(path.clone()) {
            return Err(FsError::AlreadyExists(path));
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        if !self.is_dir(&path) {
            if self.is_file(&path) {
                return Err(FsError::NotDirectory(path));
            }
            return Err(FsError::NotFound(path));
        }

        let is_child = |candidate: &str| {
            Self::is_beneath(candidate, &path)
                && Self::parent_path(candidate).as_deref() == Some(path.as_str())
        };
        let name_of = |candidate: &str| {
            candidate
                .rsplit('/')
                .next()
                .unwrap_or(candidate)
                .to_string()
        };

        let mut entries = Vec::new();
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        for file_path in files.keys().filter(|p| is_child(p)) {
            entries.push(FileEntry {
                name: name_of(file_path),
                is_dir: false,
            });
        }
        drop(files);

        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        for dir_path in dirs.iter().filter(|p| is_child(p)) {
            entries.push(FileEntry {
                name: name_of(dir_path),
                is_dir: true,
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        // Try to delete as file first
        {
            let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
            if files.remove(&path).is_some() {
                return Ok(());
            }
        }

        // Then as an empty directory
        if self.is_dir(&path) {
            if !self.list(&path).await?.is_empty() {
                return Err(FsError::NotEmpty(path));
            }
            let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
            dirs.remove(&path);
            return Ok(());
        }

        Err(FsError::NotFound(path))
    }

    async fn remove_dir_all(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if !self.is_dir(&path) {
            return Err(FsError::NotFound(path));
        }
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.retain(|p, _| !Self::is_beneath(p, &path));
        drop(files);

        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        dirs.retain(|p| !Self::is_beneath(p, &path));
        if !path.is_empty() {
            dirs.remove(&path);
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        Ok(self.is_file(&path) || self.is_dir(&path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }
        if self.is_file(&path) {
            return Err(FsError::NotDirectory(path));
        }

        // Create parent first
        if let Some(parent) = Self::parent_path(&path) {
            Box::pin(self.mkdir(&parent)).await?;
        }

        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        dirs.insert(path);
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows sharing a filesystem between several backings in tests
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).create_new(path, content).await
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        (**self).create_dir(path).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn remove_dir_all(&self, path: &str) -> Result<()> {
        (**self).remove_dir_all(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}
