//! Record transformation
//!
//! Turns harvested records into documents for the bulk sink. A transformer
//! may emit zero documents for a record (e.g. deletions) or several.

use crate::error::TransformError;
use crate::source::Record;
use serde::Serialize;
use serde_json::{json, Value};

/// A document ready to be written by a [`crate::sink::BulkSink`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    /// Stable id; writing the same id twice replaces the document
    pub id: String,
    pub index: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    pub source: Value,
}

/// Converts one record into documents
pub trait RecordTransformer: Send + Sync {
    fn transform(&self, record: &Record) -> Result<Vec<Document>, TransformError>;
}

/// Wraps each record's header and raw metadata into one JSON document
///
/// Deleted records produce no document.
#[derive(Debug, Clone)]
pub struct JsonDocumentTransformer {
    index: String,
    doc_type: Option<String>,
}

impl JsonDocumentTransformer {
    pub fn new(index: impl Into<String>, doc_type: Option<String>) -> Self {
        Self {
            index: index.into(),
            doc_type,
        }
    }
}

impl RecordTransformer for JsonDocumentTransformer {
    fn transform(&self, record: &Record) -> Result<Vec<Document>, TransformError> {
        if record.identifier.trim().is_empty() {
            return Err(TransformError::new("<missing>", "record header has no identifier"));
        }

        if record.deleted {
            return Ok(Vec::new());
        }

        let metadata = record
            .metadata
            .as_deref()
            .ok_or_else(|| TransformError::new(&record.identifier, "record has no metadata"))?;

        Ok(vec![Document {
            id: record.identifier.clone(),
            index: self.index.clone(),
            doc_type: self.doc_type.clone(),
            source: json!({
                "identifier": record.identifier,
                "datestamp": record.datestamp,
                "sets": record.sets,
                "metadata": metadata,
            }),
        }])
    }
}
