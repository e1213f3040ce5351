//! Page outcome classification
//!
//! Maps the result of one page request onto what the harvest loop does
//! next. Everything that is not a success or a served throttle ends the
//! cycle; the scheduler tries again on its next tick.

use crate::checkpoint::NO_RESPONSE_STATUS;
use crate::error::SourceError;
use crate::source::{Page, NO_RECORDS_MATCH};
use std::time::Duration;

/// Statuses that ask the client to slow down and may carry `Retry-After`
const THROTTLE_STATUSES: [u16; 2] = [429, 503];

/// How one page request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Records (possibly none) were served
    Success,
    /// The server asked us to wait this long and retry the same request
    Throttled(Duration),
    /// The cycle must stop here
    Failed { status: i32, error: String },
}

impl PageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PageOutcome::Success)
    }
}

/// Classify a page request result.
pub fn classify(result: &Result<Page, SourceError>) -> PageOutcome {
    let page = match result {
        Ok(page) => page,
        Err(err) => {
            return PageOutcome::Failed {
                status: NO_RESPONSE_STATUS,
                error: err.to_string(),
            }
        }
    };

    let status = i32::from(page.status);

    if (200..300).contains(&page.status) {
        return match page.error {
            Some(ref err) if err.code != NO_RECORDS_MATCH => PageOutcome::Failed {
                status,
                error: err.to_string(),
            },
            _ => PageOutcome::Success,
        };
    }

    match page.retry_after {
        Some(wait) if THROTTLE_STATUSES.contains(&page.status) => PageOutcome::Throttled(wait),
        _ => PageOutcome::Failed {
            status,
            error: format!("HTTP status {}", page.status),
        },
    }
}
