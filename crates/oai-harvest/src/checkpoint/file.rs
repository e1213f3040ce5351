//! JSON file checkpoint store
//!
//! Layout: `<root>/<key>/_last.json` and `<root>/<key>/_state.json`.
//! Writes go to a temporary file that is synced to disk and then renamed
//! over the target, and the previous version is kept as
//! `<id>.backup.json`. A crash mid-write leaves either the old or the new
//! document. The parent directory is not synced, so after a power loss the
//! rename itself may be lost and the previous document reappears.

use super::{validate_key, CheckpointStore, DocumentKind};
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Checkpoint store backed by a directory of JSON files
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str, kind: DocumentKind) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key).join(format!("{}.json", kind.id())))
    }

    fn backup_path(&self, key: &str, kind: DocumentKind) -> PathBuf {
        self.root.join(key).join(format!("{}.backup.json", kind.id()))
    }

    fn temp_path(&self, key: &str, kind: DocumentKind) -> PathBuf {
        self.root.join(key).join(format!("{}.tmp.json", kind.id()))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, key: &str, kind: DocumentKind) -> Result<Option<Value>, StoreError> {
        let path = self.path(key, kind)?;

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::corrupt(path.display().to_string(), e))
    }

    async fn put(&self, key: &str, kind: DocumentKind, doc: &Value) -> Result<(), StoreError> {
        let path = self.path(key, kind)?;
        let temp = self.temp_path(key, kind);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| StoreError::corrupt(path.display().to_string(), e))?;
        let mut file = fs::File::create(&temp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        if fs::try_exists(&path).await? {
            fs::copy(&path, self.backup_path(key, kind)).await?;
        }

        fs::rename(&temp, &path).await?;

        tracing::trace!(path = %path.display(), "Checkpoint document written");
        Ok(())
    }

    async fn remove(&self, key: &str, kind: DocumentKind) -> Result<bool, StoreError> {
        let path = self.path(key, kind)?;

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
