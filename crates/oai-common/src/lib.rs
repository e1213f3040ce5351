//! OAI Harvest Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities and error handling for the OAI harvester workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Common error type and result alias
//! - **Datestamps**: OAI-PMH UTC datestamp formatting and parsing
//! - **Logging**: Centralized `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use oai_common::datestamp;
//! use oai_common::Result;
//!
//! fn parse_bound(raw: &str) -> Result<()> {
//!     let ts = datestamp::parse(raw)?;
//!     println!("harvesting from {}", datestamp::format(&ts));
//!     Ok(())
//! }
//! ```

pub mod datestamp;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{OaiError, Result};
