//! Harvest checkpoints
//!
//! A [`Checkpoint`] records what the harvester attempted last for one
//! source: the request window, the resumption token still to be followed,
//! and how the last page went. It is written after every page attempt and
//! is the only input the planner needs to decide the next request.
//!
//! Checkpoints and [`HarvestState`] documents live side by side in a
//! [`CheckpointStore`], keyed by the source name.

mod file;
mod memory;
#[cfg(feature = "database")]
mod postgres;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;
#[cfg(feature = "database")]
pub use postgres::PgCheckpointStore;

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oai_common::datestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Status recorded when a page attempt got no HTTP response at all.
pub const NO_RESPONSE_STATUS: i32 = -1;

/// HTTP status of a page that was served successfully.
pub const OK_STATUS: i32 = 200;

fn no_response() -> i32 {
    NO_RESPONSE_STATUS
}

/// Persisted harvesting progress for one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Continuation token; present only while a result set is being paged
    #[serde(
        rename = "resumptionToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub resumption_token: Option<String>,

    /// Lower bound of the most recently attempted window
    #[serde(
        default,
        with = "datestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_from: Option<DateTime<Utc>>,

    /// Upper bound of the most recently attempted window
    #[serde(
        default,
        with = "datestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_until: Option<DateTime<Utc>>,

    /// Protocol, transport or flush error of the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Last HTTP status, [`NO_RESPONSE_STATUS`] when nothing came back
    #[serde(default = "no_response")]
    pub last_http_status: i32,
}

#[derive(Serialize, Deserialize)]
struct CheckpointDocument {
    oai: Checkpoint,
}

impl Checkpoint {
    /// Whether the last attempt completed cleanly: HTTP 200 and no error.
    ///
    /// Only a clean checkpoint may be resumed or advanced.
    pub fn is_clean(&self) -> bool {
        self.last_http_status == OK_STATUS && self.last_error.is_none()
    }

    /// Wrap into the persisted `{"oai": {...}}` document.
    pub fn to_document(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(CheckpointDocument { oai: self.clone() })
    }

    /// Read back a persisted `{"oai": {...}}` document.
    pub fn from_document(doc: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value::<CheckpointDocument>(doc).map(|d| d.oai)
    }
}

/// Operational bookkeeping for one source, kept next to its checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HarvestState {
    /// When the source was first activated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// Last time a cycle started or finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Records routed to the sink across all cycles
    #[serde(default)]
    pub counter: u64,

    /// Completed cycles
    #[serde(default)]
    pub cycles: u64,

    /// A cycle is currently running
    #[serde(default)]
    pub active: bool,
}

#[derive(Serialize, Deserialize)]
struct StateDocument {
    state: HarvestState,
}

impl HarvestState {
    /// Mark the beginning of a cycle
    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.started.get_or_insert(now);
        self.timestamp = Some(now);
        self.active = true;
    }

    /// Mark the end of a cycle that routed `records` to the sink
    pub fn finish(&mut self, now: DateTime<Utc>, records: u64) {
        self.timestamp = Some(now);
        self.counter += records;
        self.cycles += 1;
        self.active = false;
    }
}

/// The two documents stored per source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Checkpoint,
    State,
}

impl DocumentKind {
    /// Document id within the source's namespace
    pub fn id(self) -> &'static str {
        match self {
            DocumentKind::Checkpoint => "_last",
            DocumentKind::State => "_state",
        }
    }
}

/// Reject keys that cannot be used as a path segment or row key verbatim.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Durable document storage for checkpoints and harvest state
///
/// Implementors provide raw JSON document access; the typed accessors are
/// provided on top. Consistency is only required per key: the harvest loop
/// is the single writer for its source.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Fetch a raw document, `None` if it was never written.
    async fn get(&self, key: &str, kind: DocumentKind) -> Result<Option<Value>, StoreError>;

    /// Create or replace a raw document.
    async fn put(&self, key: &str, kind: DocumentKind, doc: &Value) -> Result<(), StoreError>;

    /// Delete a raw document, returning whether it existed.
    async fn remove(&self, key: &str, kind: DocumentKind) -> Result<bool, StoreError>;

    /// Load a source's checkpoint; `None` means never harvested.
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, StoreError> {
        match self.get(key, DocumentKind::Checkpoint).await? {
            Some(doc) => Checkpoint::from_document(doc)
                .map(Some)
                .map_err(|e| StoreError::corrupt(format!("{}/_last", key), e)),
            None => Ok(None),
        }
    }

    /// Persist a source's checkpoint.
    async fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let doc = checkpoint
            .to_document()
            .map_err(|e| StoreError::corrupt(format!("{}/_last", key), e))?;
        self.put(key, DocumentKind::Checkpoint, &doc).await
    }

    /// Load a source's bookkeeping; missing state is returned as fresh.
    async fn load_state(&self, key: &str) -> Result<HarvestState, StoreError> {
        match self.get(key, DocumentKind::State).await? {
            Some(doc) => serde_json::from_value::<StateDocument>(doc)
                .map(|d| d.state)
                .map_err(|e| StoreError::corrupt(format!("{}/_state", key), e)),
            None => Ok(HarvestState::default()),
        }
    }

    /// Persist a source's bookkeeping.
    async fn save_state(&self, key: &str, state: &HarvestState) -> Result<(), StoreError> {
        let doc = serde_json::to_value(StateDocument {
            state: state.clone(),
        })
        .map_err(|e| StoreError::corrupt(format!("{}/_state", key), e))?;
        self.put(key, DocumentKind::State, &doc).await
    }

    /// Forget a source's progress so the next cycle starts from scratch.
    async fn reset(&self, key: &str) -> Result<bool, StoreError> {
        self.remove(key, DocumentKind::Checkpoint).await
    }
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn get(&self, key: &str, kind: DocumentKind) -> Result<Option<Value>, StoreError> {
        (**self).get(key, kind).await
    }

    async fn put(&self, key: &str, kind: DocumentKind, doc: &Value) -> Result<(), StoreError> {
        (**self).put(key, kind, doc).await
    }

    async fn remove(&self, key: &str, kind: DocumentKind) -> Result<bool, StoreError> {
        (**self).remove(key, kind).await
    }
}
