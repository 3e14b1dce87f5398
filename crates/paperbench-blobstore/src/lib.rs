//! Blob Store Façade (spec §4.B): path-addressed bytes with `exists`,
//! `read`, `write`, `list`, `glob`, `join`. The core only relies on
//! these six operations and read-your-writes for a single writer; this
//! crate ships a local-filesystem implementation. A remote
//! object-store backend would implement the same trait without any
//! caller changes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("blob store io error: {0}")]
    Io(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, path: &str) -> bool;
    async fn read(&self, path: &str) -> Result<Vec<u8>, BlobStoreError>;
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), BlobStoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError>;
    async fn glob(&self, pattern: &str) -> Result<Vec<String>, BlobStoreError>;
    fn join(&self, parts: &[&str]) -> String;
}

/// Local-filesystem blob store rooted at a fixed directory. Writes go
/// through a write-to-temp-then-rename so a reader never observes a
/// half-written file (the same atomic-write idiom used for every
/// on-disk artifact in this workspace — `status.json`,
/// `grader_output.json`, submission archives).
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn exists(&self, path: &str) -> bool {
        tokio::fs::metadata(self.resolve(path)).await.is_ok()
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, BlobStoreError> {
        let full = self.resolve(path);
        tokio::fs::read(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobStoreError::NotFound(path.to_string())
            } else {
                BlobStoreError::Io(e.to_string())
            }
        })
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobStoreError::Io(e.to_string()))?;
        }
        atomic_write(&full, bytes).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let full = self.resolve(prefix);
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&full).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(BlobStoreError::Io(e.to_string())),
        };
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| BlobStoreError::Io(e.to_string()))?
        {
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(&entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            entries.push(relative);
        }
        entries.sort();
        Ok(entries)
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<String>, BlobStoreError> {
        let full_pattern = self.resolve(pattern).to_string_lossy().into_owned();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            for entry in glob::glob(&full_pattern).map_err(|e| BlobStoreError::Io(e.to_string()))? {
                let path = entry.map_err(|e| BlobStoreError::Io(e.to_string()))?;
                let relative = path
                    .strip_prefix(&root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                matches.push(relative);
            }
            matches.sort();
            Ok(matches)
        })
        .await
        .map_err(|e| BlobStoreError::Io(e.to_string()))?
    }

    fn join(&self, parts: &[&str]) -> String {
        let mut joined = PathBuf::new();
        for part in parts {
            joined.push(part.trim_start_matches('/'));
        }
        joined.to_string_lossy().replace('\\', "/")
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), BlobStoreError> {
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| BlobStoreError::Io(format!("failed to write temp file: {e}")))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| BlobStoreError::Io(format!("failed to rename temp file: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store.write("a/b.json", b"{}").await.unwrap();
        assert!(store.exists("a/b.json").await);
        assert_eq!(store.read("a/b.json").await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn read_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let err = store.read("missing.json").await.unwrap_err();
        assert!(matches!(err, BlobStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_and_glob_find_written_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store.write("runs/g1/r1/status.json", b"{}").await.unwrap();
        store.write("runs/g1/r2/status.json", b"{}").await.unwrap();

        let listed = store.list("runs/g1").await.unwrap();
        assert_eq!(listed.len(), 2);

        let globbed = store.glob("runs/g1/*/status.json").await.unwrap();
        assert_eq!(globbed.len(), 2);
    }

    #[test]
    fn join_normalizes_separators() {
        let store = LocalBlobStore::new("/tmp/irrelevant");
        assert_eq!(store.join(&["runs", "group", "run"]), "runs/group/run");
    }
}
