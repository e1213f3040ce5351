//! Elasticsearch-compatible `_bulk` sink
//!
//! Documents are buffered into batches of `max_bulk_actions`. Each full
//! batch is sent as one NDJSON request on a background task; at most
//! `max_concurrent_bulk_requests` batches are in flight; `index` waits for
//! a free slot beyond that. `flush` sends the partial batch and waits for
//! every in-flight request.

use super::BulkSink;
use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::transform::Document;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};
use url::Url;

/// Longest error body kept in a [`SinkError::Status`]
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

/// Bulk sink writing to `<url>/_bulk`
pub struct HttpBulkSink {
    client: reqwest::Client,
    endpoint: Url,
    max_actions: usize,
    timeout: Duration,
    permits: Arc<Semaphore>,
    buffer: Mutex<Vec<Document>>,
    in_flight: Mutex<JoinSet<Result<usize, SinkError>>>,
    failure: Mutex<Option<SinkError>>,
    closed: AtomicBool,
}

impl HttpBulkSink {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Build a sink on an existing client so connections are pooled.
    pub fn with_client(client: reqwest::Client, config: &SinkConfig) -> Result<Self, SinkError> {
        let endpoint = Url::parse(&format!("{}/_bulk", config.url.trim_end_matches('/')))
            .map_err(|_| SinkError::InvalidEndpoint(config.url.clone()))?;

        Ok(Self {
            client,
            endpoint,
            max_actions: config.max_bulk_actions.max(1),
            timeout: config.bulk_timeout(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_bulk_requests.max(1))),
            buffer: Mutex::new(Vec::new()),
            in_flight: Mutex::new(JoinSet::new()),
            failure: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn dispatch(&self, batch: Vec<Document>) -> Result<(), SinkError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SinkError::Closed)?;

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let timeout = self.timeout;

        let mut in_flight = self.in_flight.lock().await;
        while let Some(result) = in_flight.try_join_next() {
            self.record(result).await;
        }

        debug!(documents = batch.len(), "Dispatching bulk request");
        in_flight.spawn(async move {
            let _permit = permit;
            send_batch(&client, endpoint, timeout, batch).await
        });

        Ok(())
    }

    async fn record(&self, result: Result<Result<usize, SinkError>, JoinError>) {
        let error = match result {
            Ok(Ok(count)) => {
                debug!(documents = count, "Bulk request acknowledged");
                return;
            }
            Ok(Err(e)) => e,
            Err(e) => SinkError::Transport(format!("bulk task failed: {}", e)),
        };

        warn!(error = %error, "Bulk request failed");
        let mut failure = self.failure.lock().await;
        if failure.is_none() {
            *failure = Some(error);
        }
    }
}

#[async_trait]
impl BulkSink for HttpBulkSink {
    async fn index(&self, document: Document) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }

        let full = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(document);
            (buffer.len() >= self.max_actions).then(|| std::mem::take(&mut *buffer))
        };

        match full {
            Some(batch) => self.dispatch(batch).await,
            None => Ok(()),
        }
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let rest = std::mem::take(&mut *self.buffer.lock().await);
        if !rest.is_empty() {
            self.dispatch(rest).await?;
        }

        {
            let mut in_flight = self.in_flight.lock().await;
            while let Some(result) = in_flight.join_next().await {
                self.record(result).await;
            }
        }

        match self.failure.lock().await.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), SinkError> {
        let result = self.flush().await;
        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        result
    }
}

/// Encode documents as `_bulk` NDJSON: one action line, one source line each.
fn encode(batch: &[Document]) -> Result<Vec<u8>, SinkError> {
    let mut body = Vec::with_capacity(batch.len() * 256);

    for doc in batch {
        let mut action = json!({ "_index": doc.index, "_id": doc.id });
        if let Some(ref doc_type) = doc.doc_type {
            action["_type"] = json!(doc_type);
        }
        serde_json::to_writer(&mut body, &json!({ "index": action }))?;
        body.push(b'\n');
        serde_json::to_writer(&mut body, &doc.source)?;
        body.push(b'\n');
    }

    Ok(body)
}

async fn send_batch(
    client: &reqwest::Client,
    endpoint: Url,
    timeout: Duration,
    batch: Vec<Document>,
) -> Result<usize, SinkError> {
    let total = batch.len();
    let body = encode(&batch)?;

    let response = client
        .post(endpoint)
        .header(CONTENT_TYPE, "application/x-ndjson")
        .timeout(timeout)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                SinkError::Timeout(timeout)
            } else {
                SinkError::from(e)
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|&i| body.is_char_boundary(i))
                .unwrap_or(0);
            body.truncate(cut);
        }
        return Err(SinkError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let reply: BulkResponse = response.json().await?;
    if reply.errors {
        let failures: Vec<&BulkItem> = reply
            .items
            .iter()
            .flat_map(|item| item.values())
            .filter(|item| item.status >= 300 || item.error.is_some())
            .collect();

        if !failures.is_empty() {
            let first_error = failures[0]
                .error
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_else(|| format!("status {}", failures[0].status));
            return Err(SinkError::Rejected {
                failed: failures.len(),
                total,
                first_error,
            });
        }
    }

    Ok(total)
}
