//! In-memory sink with upsert-by-id semantics

use super::BulkSink;
use crate::error::SinkError;
use crate::transform::Document;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Buffers documents until `flush`, then commits them keyed by id
#[derive(Debug, Default)]
pub struct MemorySink {
    pending: Mutex<Vec<Document>>,
    committed: Mutex<BTreeMap<String, Document>>,
    flushes: AtomicUsize,
    flush_attempts: AtomicUsize,
    writes: AtomicUsize,
    /// 1-based flush attempt that fails, 0 for none
    fail_flush_at: AtomicUsize,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `flush` fail and keep its documents pending.
    pub fn fail_next_flush(&self) {
        self.fail_flush_after(0);
    }

    /// Let `successes` more flushes through, then fail one.
    pub fn fail_flush_after(&self, successes: usize) {
        let attempts = self.flush_attempts.load(Ordering::SeqCst);
        self.fail_flush_at
            .store(attempts + successes + 1, Ordering::SeqCst);
    }

    /// Ids of committed documents, sorted
    pub async fn committed_ids(&self) -> Vec<String> {
        self.committed.lock().await.keys().cloned().collect()
    }

    pub async fn committed(&self, id: &str) -> Option<Document> {
        self.committed.lock().await.get(id).cloned()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Number of successful flushes
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Total documents committed, counting overwrites
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BulkSink for MemorySink {
    async fn index(&self, document: Document) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        self.pending.lock().await.push(document);
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut pending = self.pending.lock().await;

        let attempt = self.flush_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .fail_flush_at
            .compare_exchange(attempt, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Err(SinkError::Transport("injected flush failure".to_string()));
        }

        let mut committed = self.committed.lock().await;
        for doc in pending.drain(..) {
            self.writes.fetch_add(1, Ordering::SeqCst);
            committed.insert(doc.id.clone(), doc);
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.flush().await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
