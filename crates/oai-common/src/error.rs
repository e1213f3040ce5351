//! Error types shared across the harvester crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, OaiError>;

/// Main error type for shared utilities
#[derive(Error, Debug)]
pub enum OaiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid datestamp '{value}': expected YYYY-MM-DD or YYYY-MM-DDThh:mm:ssZ")]
    InvalidDatestamp { value: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl OaiError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid datestamp error
    pub fn invalid_datestamp(value: impl Into<String>) -> Self {
        Self::InvalidDatestamp {
            value: value.into(),
        }
    }
}
