//! OAI-PMH ListRecords sources
//!
//! An [`OaiSource`] executes exactly one ListRecords page request. It
//! returns `Ok(Page)` whenever the server answered, whatever the status,
//! and `Err(SourceError)` only when no response was obtained.

mod envelope;
mod http;

pub use http::HttpOaiSource;

use crate::error::SourceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oai_common::datestamp;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// OAI error code meaning "the result set is empty", not a failure
pub const NO_RECORDS_MATCH: &str = "noRecordsMatch";

/// One ListRecords request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestRequest {
    pub url: String,
    pub set: Option<String>,
    pub metadata_prefix: String,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub resumption_token: Option<String>,
}

impl HarvestRequest {
    /// The follow-up request for the next page of the same result set.
    ///
    /// The window bounds are carried along for logging and checkpointing;
    /// only the token goes on the wire.
    pub fn continue_with(&self, token: impl Into<String>) -> Self {
        Self {
            resumption_token: Some(token.into()),
            ..self.clone()
        }
    }

    /// Query parameters as sent to the repository
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("verb", "ListRecords".to_string())];

        if let Some(ref token) = self.resumption_token {
            pairs.push(("resumptionToken", token.clone()));
            return pairs;
        }

        pairs.push(("metadataPrefix", self.metadata_prefix.clone()));
        if let Some(ref set) = self.set {
            pairs.push(("set", set.clone()));
        }
        if let Some(ref from) = self.from {
            pairs.push(("from", datestamp::format(from)));
        }
        if let Some(ref until) = self.until {
            pairs.push(("until", datestamp::format(until)));
        }
        pairs
    }

    /// Full request URL, keeping any query the base URL already carries
    pub fn to_url(&self) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| SourceError::InvalidRequest(format!("{}: {}", self.url, e)))?;
        url.query_pairs_mut().extend_pairs(self.query_pairs());
        Ok(url)
    }
}

impl fmt::Display for HarvestRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |ts: &Option<DateTime<Utc>>| {
            ts.as_ref()
                .map(datestamp::format)
                .unwrap_or_else(|| "*".to_string())
        };
        match self.resumption_token {
            Some(ref token) => write!(f, "{} resumptionToken={}", self.url, token),
            None => write!(
                f,
                "{} set={} metadataPrefix={} window=[{}, {}]",
                self.url,
                self.set.as_deref().unwrap_or("*"),
                self.metadata_prefix,
                bound(&self.from),
                bound(&self.until)
            ),
        }
    }
}

/// A harvested record: header fields plus the opaque metadata payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub identifier: String,
    pub datestamp: Option<String>,
    pub sets: Vec<String>,
    pub deleted: bool,
    /// Raw XML inside `<metadata>`, absent for deleted records
    pub metadata: Option<String>,
}

/// An `<error code="...">` element returned by the repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// The response to one page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub status: u16,
    pub records: Vec<Record>,
    /// Token for the next page; `None` on the last page
    pub resumption_token: Option<String>,
    pub error: Option<ProtocolError>,
    /// Server-requested wait before retrying (`Retry-After`)
    pub retry_after: Option<Duration>,
}

impl Page {
    /// A response that carried no usable body
    pub fn status_only(status: u16, retry_after: Option<Duration>) -> Self {
        Self {
            status,
            records: Vec::new(),
            resumption_token: None,
            error: None,
            retry_after,
        }
    }
}

/// Executes ListRecords page requests against one repository
#[async_trait]
pub trait OaiSource: Send + Sync {
    /// Issue a single page request.
    ///
    /// Must not retry internally; throttling and failures are decided by
    /// the harvest loop from the returned page.
    async fn list_records(&self, request: &HarvestRequest) -> Result<Page, SourceError>;
}

#[async_trait]
impl<T: OaiSource + ?Sized> OaiSource for Arc<T> {
    async fn list_records(&self, request: &HarvestRequest) -> Result<Page, SourceError> {
        (**self).list_records(request).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request() -> HarvestRequest {
        HarvestRequest {
            url: "http://example.org/oai?x=1".to_string(),
            set: Some("physics".to_string()),
            metadata_prefix: "oai_dc".to_string(),
            from: Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
            until: Some(Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap()),
            resumption_token: None,
        }
    }

    #[test]
    fn test_initial_request_sends_window() {
        let url = request().to_url().unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

        assert_eq!(
            pairs,
            vec![
                ("x".to_string(), "1".to_string()),
                ("verb".to_string(), "ListRecords".to_string()),
                ("metadataPrefix".to_string(), "oai_dc".to_string()),
                ("set".to_string(), "physics".to_string()),
                ("from".to_string(), "2020-01-01T00:00:00Z".to_string()),
                ("until".to_string(), "2020-01-02T00:00:00Z".to_string()),
            ]
        );
    }

    #[test]
    fn test_continuation_sends_only_token() {
        let next = request().continue_with("R1");
        let pairs = next.query_pairs();

        assert_eq!(
            pairs,
            vec![
                ("verb", "ListRecords".to_string()),
                ("resumptionToken", "R1".to_string()),
            ]
        );
        assert_eq!(next.from, request().from);
    }

    #[test]
    fn test_invalid_base_url() {
        let mut req = request();
        req.url = "not a url".to_string();
        assert!(matches!(req.to_url(), Err(SourceError::InvalidRequest(_))));
    }
}
