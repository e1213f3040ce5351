//! Bulk sinks
//!
//! A [`BulkSink`] accepts documents one at a time and may buffer them;
//! [`BulkSink::flush`] is the barrier the harvest loop relies on before it
//! records progress. A sink can be shared by several sources.

mod http;
mod memory;

pub use http::HttpBulkSink;
pub use memory::MemorySink;

use crate::error::SinkError;
use crate::transform::Document;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Queue a document for writing. May wait when the sink is saturated.
    async fn index(&self, document: Document) -> Result<(), SinkError>;

    /// Wait until every queued document is acknowledged, or report why not.
    async fn flush(&self) -> Result<(), SinkError>;

    /// Flush and refuse further documents.
    async fn close(&self) -> Result<(), SinkError> {
        self.flush().await
    }
}

#[async_trait]
impl<T: BulkSink + ?Sized> BulkSink for Arc<T> {
    async fn index(&self, document: Document) -> Result<(), SinkError> {
        (**self).index(document).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        (**self).flush().await
    }

    async fn close(&self) -> Result<(), SinkError> {
        (**self).close().await
    }
}
