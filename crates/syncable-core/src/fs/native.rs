//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use rand::Rng;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{FileEntry, FileSystem, FsError, Result};

/// Filesystem rooted at a base directory on disk.
#[derive(Debug, Clone)]
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    /// Generate a random hex string for temp file names.
    fn random_hex() -> String {
        let bytes: [u8; 8] = rand::rng().random();
        hex::encode(bytes)
    }

    /// Atomic write using temp file + rename.
    ///
    /// The temp file is a dot-file in the same directory, so listings that
    /// skip hidden entries never observe it.
    async fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(".{}.{}.tmp", name, Self::random_hex()));

        if let Err(e) = fs::write(&temp_path, content).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        Ok(())
    }
}

fn map_io(path: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        ErrorKind::IsADirectory => FsError::IsDirectory(path.to_string()),
        ErrorKind::NotADirectory => FsError::NotDirectory(path.to_string()),
        ErrorKind::DirectoryNotEmpty => FsError::NotEmpty(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, e)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path);
        fs::read(&full_path).await.map_err(|e| map_io(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        // Create parent directories if needed
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }

        Self::atomic_write(&full_path, content)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let full_path = self.full_path(path);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
            .await
            .map_err(|e| map_io(path, e))?;
        file.write_all(content).await.map_err(|e| map_io(path, e))?;
        file.flush().await.map_err(|e| map_io(path, e))
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        fs::create_dir(&full_path)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full_path = self.full_path(path);
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| map_io(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| map_io(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type().await.map_err(|e| map_io(path, e))?;

            entries.push(FileEntry {
                name,
                is_dir: file_type.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_io(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path)
                .await
                .map_err(|e| map_io(path, e))
        } else {
            fs::remove_file(&full_path)
                .await
                .map_err(|e| map_io(path, e))
        }
    }

    async fn remove_dir_all(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        fs::remove_dir_all(&full_path)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path);
        fs::try_exists(&full_path)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| map_io(path, e))
    }
}
