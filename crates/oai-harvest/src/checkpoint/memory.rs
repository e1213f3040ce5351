//! In-memory checkpoint store for tests and dry runs

use super::{validate_key, Checkpoint, CheckpointStore, DocumentKind};
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Checkpoint store that keeps documents in a map
///
/// Load failures can be injected to exercise the store-unavailable path.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    documents: Mutex<HashMap<(String, &'static str), Value>>,
    history: Mutex<Vec<Checkpoint>>,
    failing_loads: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` reads fail with [`StoreError::Unavailable`].
    pub fn fail_next_loads(&self, count: usize) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Every checkpoint saved so far, oldest first.
    pub async fn history(&self) -> Vec<Checkpoint> {
        self.history.lock().await.clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, key: &str, kind: DocumentKind) -> Result<Option<Value>, StoreError> {
        validate_key(key)?;

        let injected = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected load failure".to_string()));
        }

        let documents = self.documents.lock().await;
        Ok(documents.get(&(key.to_string(), kind.id())).cloned())
    }

    async fn put(&self, key: &str, kind: DocumentKind, doc: &Value) -> Result<(), StoreError> {
        validate_key(key)?;

        if kind == DocumentKind::Checkpoint {
            let checkpoint = Checkpoint::from_document(doc.clone())
                .map_err(|e| StoreError::corrupt(format!("{}/_last", key), e))?;
            self.history.lock().await.push(checkpoint);
        }

        self.documents
            .lock()
            .await
            .insert((key.to_string(), kind.id()), doc.clone());
        Ok(())
    }

    async fn remove(&self, key: &str, kind: DocumentKind) -> Result<bool, StoreError> {
        validate_key(key)?;
        Ok(self
            .documents
            .lock()
            .await
            .remove(&(key.to_string(), kind.id()))
            .is_some())
    }
}
