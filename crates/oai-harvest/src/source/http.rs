//! HTTP ListRecords source

use super::{envelope, HarvestRequest, OaiSource, Page, ProtocolError};
use crate::config::SourceConfig;
use crate::error::SourceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;
use tracing::debug;

/// OAI-PMH source over HTTP
pub struct HttpOaiSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpOaiSource {
    /// Build a client honoring the source's timeout and proxy settings.
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let timeout = config.timeout();
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("oai-harvest/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy) = config.proxy_url() {
            let proxy = reqwest::Proxy::all(&proxy)
                .map_err(|e| SourceError::InvalidRequest(format!("proxy {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl OaiSource for HttpOaiSource {
    async fn list_records(&self, request: &HarvestRequest) -> Result<Page, SourceError> {
        let url = request.to_url()?;
        debug!(url = %url, "Requesting ListRecords page");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout(self.timeout)
            } else {
                SourceError::from(e)
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = retry_after(response.headers(), Utc::now());

        if !response.status().is_success() {
            return Ok(Page::status_only(status, retry_after));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout(self.timeout)
            } else {
                SourceError::from(e)
            }
        })?;

        let page = match envelope::parse(&body) {
            Ok(env) => Page {
                status,
                records: env.records,
                resumption_token: env.resumption_token,
                error: env.error,
                retry_after,
            },
            Err(reason) => Page {
                error: Some(ProtocolError {
                    code: "malformedResponse".to_string(),
                    message: reason,
                }),
                ..Page::status_only(status, retry_after)
            },
        };

        Ok(page)
    }
}

/// Read `Retry-After` as either delta-seconds or an HTTP date.
fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs)).filter(|d| !d.is_zero());
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok().filter(|d| !d.is_zero())
}
