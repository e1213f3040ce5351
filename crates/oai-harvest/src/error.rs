//! Error types for the harvester
//!
//! Collaborators report their own error type; [`HarvestError`] is what
//! crosses the harvest loop boundary.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for harvester operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// A page request that produced no HTTP response
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// A record that could not be turned into documents
#[derive(Error, Debug)]
#[error("cannot transform record '{identifier}': {reason}")]
pub struct TransformError {
    pub identifier: String,
    pub reason: String,
}

impl TransformError {
    pub fn new(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }
}

/// Bulk write failures
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("bulk request rejected {failed} of {total} documents: {first_error}")]
    Rejected {
        failed: usize,
        total: usize,
        first_error: String,
    },

    #[error("bulk request failed with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("bulk request timed out after {0:?}")]
    Timeout(Duration),

    #[error("bulk transport error: {0}")]
    Transport(String),

    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid bulk endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("sink is closed")]
    Closed,
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Checkpoint store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("checkpoint store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt document '{id}': {reason}")]
    Corrupt { id: String, reason: String },

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid checkpoint key '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidKey(String),

    #[cfg(feature = "database")]
    #[error("checkpoint database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn corrupt(id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt {
            id: id.into(),
            reason: reason.to_string(),
        }
    }
}

/// Main error type for the harvester
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] oai_common::OaiError),
}

impl HarvestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
