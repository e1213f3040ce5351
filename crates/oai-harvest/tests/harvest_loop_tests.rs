//! Harvest loop tests
//!
//! These tests drive full cycles against scripted repositories and the
//! in-memory sink and checkpoint store:
//! - Planning from virgin, clean, failed and paging checkpoints
//! - Throttle handling and the skipped poll delay
//! - Failure persistence (HTTP status, protocol error, timeout, flush)
//! - Flush-before-checkpoint ordering and idempotent replay
//! - Cancellation and checkpoint store cool-down

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use oai_harvest::checkpoint::{
    Checkpoint, CheckpointStore, DocumentKind, MemoryCheckpointStore, NO_RESPONSE_STATUS,
};
use oai_harvest::error::{SinkError, SourceError, StoreError};
use oai_harvest::harvester::{Clock, HarvestLoop, LoopSettings};
use oai_harvest::planner::{PlanDecision, StaticWindow, TimeWindowPlanner};
use oai_harvest::sink::{BulkSink, MemorySink};
use oai_harvest::source::{HarvestRequest, OaiSource, Page, ProtocolError, Record};
use oai_harvest::transform::{Document, JsonDocumentTransformer};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const KEY: &str = "example-physics";

// ============================================================================
// Test Collaborators
// ============================================================================

/// Repository that answers from a fixed script and records every request
#[derive(Default)]
struct ScriptedSource {
    responses: Mutex<VecDeque<Result<Page, SourceError>>>,
    requests: Mutex<Vec<HarvestRequest>>,
    delay: Option<Duration>,
    cancel_on_request: Option<(usize, CancellationToken)>,
}

impl ScriptedSource {
    fn new(responses: Vec<Result<Page, SourceError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<HarvestRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl OaiSource for ScriptedSource {
    async fn list_records(&self, request: &HarvestRequest) -> Result<Page, SourceError> {
        let count = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some((at, ref cancel)) = self.cancel_on_request {
            if at == count {
                cancel.cancel();
            }
        }

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SourceError::Transport("script exhausted".to_string())))
    }
}

/// Sink that logs flushes into a shared event list
struct LoggingSink {
    inner: MemorySink,
    events: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl BulkSink for LoggingSink {
    async fn index(&self, document: Document) -> Result<(), SinkError> {
        self.inner.index(document).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.events.lock().unwrap().push("flush");
        self.inner.flush().await
    }
}

/// Store that logs checkpoint writes into a shared event list
struct LoggingStore {
    inner: MemoryCheckpointStore,
    events: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl CheckpointStore for LoggingStore {
    async fn get(&self, key: &str, kind: DocumentKind) -> Result<Option<Value>, StoreError> {
        self.inner.get(key, kind).await
    }

    async fn put(&self, key: &str, kind: DocumentKind, doc: &Value) -> Result<(), StoreError> {
        if kind == DocumentKind::Checkpoint {
            self.events.lock().unwrap().push("save");
        }
        self.inner.put(key, kind, doc).await
    }

    async fn remove(&self, key: &str, kind: DocumentKind) -> Result<bool, StoreError> {
        self.inner.remove(key, kind).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, d, 0, 0, 0).unwrap()
}

fn fixed(now: DateTime<Utc>) -> Clock {
    Arc::new(move || now)
}

fn record(id: &str) -> Record {
    Record {
        identifier: id.to_string(),
        datestamp: Some("2020-01-01T10:00:00Z".to_string()),
        sets: vec!["physics".to_string()],
        deleted: false,
        metadata: Some(format!("<dc:title>{}</dc:title>", id)),
    }
}

fn ok_page(ids: &[&str], token: Option<&str>) -> Result<Page, SourceError> {
    Ok(Page {
        status: 200,
        records: ids.iter().map(|id| record(id)).collect(),
        resumption_token: token.map(String::from),
        error: None,
        retry_after: None,
    })
}

fn status_page(status: u16, retry_after_secs: Option<u64>) -> Result<Page, SourceError> {
    Ok(Page::status_only(
        status,
        retry_after_secs.map(Duration::from_secs),
    ))
}

fn settings(window: StaticWindow) -> LoopSettings {
    LoopSettings {
        key: KEY.to_string(),
        template: HarvestRequest {
            url: "http://example.org/oai".to_string(),
            set: Some("physics".to_string()),
            metadata_prefix: "oai_dc".to_string(),
            from: None,
            until: None,
            resumption_token: None,
        },
        planner: TimeWindowPlanner::new(window),
        timeout: Duration::from_secs(5),
        cooldown: Duration::from_secs(60),
    }
}

fn jan_1_to_2() -> StaticWindow {
    StaticWindow {
        from: Some(day(1)),
        until: Some(day(2)),
    }
}

fn clean(from: DateTime<Utc>, until: DateTime<Utc>, token: Option<&str>) -> Checkpoint {
    Checkpoint {
        resumption_token: token.map(String::from),
        last_from: Some(from),
        last_until: Some(until),
        last_error: None,
        last_http_status: 200,
    }
}

type TestLoop = HarvestLoop<
    Arc<ScriptedSource>,
    JsonDocumentTransformer,
    Arc<MemorySink>,
    Arc<MemoryCheckpointStore>,
>;

struct Harness {
    source: Arc<ScriptedSource>,
    sink: Arc<MemorySink>,
    store: Arc<MemoryCheckpointStore>,
    harvest: TestLoop,
}

fn harness_with(source: ScriptedSource, window: StaticWindow, now: DateTime<Utc>) -> Harness {
    let source = Arc::new(source);
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    let harvest = HarvestLoop::new(
        settings(window),
        Arc::clone(&source),
        JsonDocumentTransformer::new("oai", None),
        Arc::clone(&sink),
        Arc::clone(&store),
    )
    .with_clock(fixed(now));

    Harness {
        source,
        sink,
        store,
        harvest,
    }
}

fn harness(responses: Vec<Result<Page, SourceError>>, now: DateTime<Utc>) -> Harness {
    harness_with(ScriptedSource::new(responses), jan_1_to_2(), now)
}

async fn last_checkpoint(h: &Harness) -> Checkpoint {
    h.store.load(KEY).await.unwrap().expect("checkpoint written")
}

// ============================================================================
// Planning Scenarios
// ============================================================================

#[tokio::test]
async fn test_virgin_source_harvests_configured_window() {
    let h = harness(vec![ok_page(&["oai:x:1", "oai:x:2"], None)], day(10));

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert_eq!(
        report.decision,
        Some(PlanDecision::First {
            from: Some(day(1)),
            until: Some(day(2)),
        })
    );
    assert!(!report.failed);
    assert_eq!(report.records, 2);
    assert_eq!(report.documents, 2);

    let requests = h.source.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].from, Some(day(1)));
    assert_eq!(requests[0].until, Some(day(2)));
    assert_eq!(requests[0].resumption_token, None);

    assert_eq!(last_checkpoint(&h).await, clean(day(1), day(2), None));
    assert_eq!(h.sink.committed_ids().await, vec!["oai:x:1", "oai:x:2"]);
}

#[tokio::test]
async fn test_clean_token_resumes_without_window_on_the_wire() {
    let h = harness(vec![ok_page(&["oai:x:3"], None)], day(10));
    h.store
        .save(KEY, &clean(day(1), day(2), Some("R1")))
        .await
        .unwrap();

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(matches!(report.decision, Some(PlanDecision::Resume { ref token, .. }) if token == "R1"));

    let requests = h.source.requests();
    assert_eq!(requests[0].resumption_token.as_deref(), Some("R1"));
    let on_wire: Vec<&str> = requests[0].query_pairs().iter().map(|(k, _)| *k).collect();
    assert_eq!(on_wire, vec!["verb", "resumptionToken"]);

    // The result set is complete; the window is kept for the next advance
    assert_eq!(last_checkpoint(&h).await, clean(day(1), day(2), None));
}

#[tokio::test]
async fn test_closed_window_advances_by_its_width() {
    // The new upper bound is exactly the clock skew behind now
    let now = day(3) + chrono::TimeDelta::seconds(15);
    let h = harness(vec![ok_page(&[], None)], now);
    h.store.save(KEY, &clean(day(1), day(2), None)).await.unwrap();

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert_eq!(
        report.decision,
        Some(PlanDecision::Advance {
            from: day(2),
            until: day(3),
        })
    );
    let requests = h.source.requests();
    assert_eq!(requests[0].from, Some(day(2)));
    assert_eq!(requests[0].until, Some(day(3)));
    assert_eq!(last_checkpoint(&h).await, clean(day(2), day(3), None));
}

#[tokio::test]
async fn test_window_ending_exactly_now_waits() {
    let h = harness(vec![], day(3));
    h.store.save(KEY, &clean(day(1), day(2), None)).await.unwrap();

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert_eq!(report.decision, Some(PlanDecision::Wait));
    assert!(h.source.requests().is_empty());
}

#[tokio::test]
async fn test_open_window_waits_without_requesting() {
    let h = harness(vec![], day(3) + chrono::TimeDelta::seconds(10));
    h.store.save(KEY, &clean(day(1), day(2), None)).await.unwrap();
    let saved_before = h.store.history().await.len();

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert_eq!(report.decision, Some(PlanDecision::Wait));
    assert!(!report.failed);
    assert!(h.source.requests().is_empty());
    assert_eq!(h.store.history().await.len(), saved_before);
}

// ============================================================================
// Paging
// ============================================================================

#[tokio::test]
async fn test_follows_tokens_and_checkpoints_every_page() {
    let h = harness(
        vec![
            ok_page(&["oai:x:1", "oai:x:2"], Some("T1")),
            ok_page(&["oai:x:3"], Some("T2")),
            ok_page(&["oai:x:4"], None),
        ],
        day(10),
    );

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert_eq!(report.pages, 3);
    assert_eq!(report.records, 4);
    assert_eq!(report.last_status, Some(200));

    let tokens: Vec<Option<String>> = h
        .source
        .requests()
        .into_iter()
        .map(|r| r.resumption_token)
        .collect();
    assert_eq!(
        tokens,
        vec![None, Some("T1".to_string()), Some("T2".to_string())]
    );

    let saved: Vec<Option<String>> = h
        .store
        .history()
        .await
        .into_iter()
        .map(|c| c.resumption_token)
        .collect();
    assert_eq!(
        saved,
        vec![Some("T1".to_string()), Some("T2".to_string()), None]
    );
    assert_eq!(h.sink.flush_count(), 3);
}

#[tokio::test]
async fn test_sink_is_flushed_before_each_checkpoint() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let harvest = HarvestLoop::new(
        settings(jan_1_to_2()),
        ScriptedSource::new(vec![ok_page(&["oai:x:1"], Some("T1")), ok_page(&["oai:x:2"], None)]),
        JsonDocumentTransformer::new("oai", None),
        LoggingSink {
            inner: MemorySink::new(),
            events: Arc::clone(&events),
        },
        LoggingStore {
            inner: MemoryCheckpointStore::new(),
            events: Arc::clone(&events),
        },
    )
    .with_clock(fixed(day(10)));

    harvest.run_cycle(&CancellationToken::new()).await;

    assert_eq!(
        *events.lock().unwrap(),
        vec!["flush", "save", "flush", "save"]
    );
}

#[tokio::test]
async fn test_replay_after_lost_checkpoint_is_idempotent() {
    let h = harness(
        vec![
            ok_page(&["oai:x:1", "oai:x:2"], None),
            ok_page(&["oai:x:1", "oai:x:2"], None),
        ],
        day(10),
    );
    let cancel = CancellationToken::new();

    h.harvest.run_cycle(&cancel).await;
    let first = h.sink.committed_ids().await;

    // Crash after the flush, before the checkpoint reached the store
    h.store.reset(KEY).await.unwrap();
    h.harvest.run_cycle(&cancel).await;

    assert_eq!(h.sink.committed_ids().await, first);
    assert_eq!(h.sink.write_count(), 4);
}

#[tokio::test]
async fn test_transform_errors_skip_the_record() {
    let broken = record("");
    let mut deleted = record("oai:x:gone");
    deleted.deleted = true;
    deleted.metadata = None;

    let h = harness(
        vec![Ok(Page {
            status: 200,
            records: vec![record("oai:x:1"), broken, deleted],
            resumption_token: None,
            error: None,
            retry_after: None,
        })],
        day(10),
    );

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(!report.failed);
    assert_eq!(report.records, 3);
    assert_eq!(report.documents, 1);
    assert_eq!(report.skipped, 1);
    assert!(last_checkpoint(&h).await.is_clean());
}

#[tokio::test]
async fn test_no_records_match_is_an_empty_success() {
    let h = harness(
        vec![Ok(Page {
            status: 200,
            records: vec![],
            resumption_token: None,
            error: Some(ProtocolError {
                code: "noRecordsMatch".to_string(),
                message: String::new(),
            }),
            retry_after: None,
        })],
        day(10),
    );

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(!report.failed);
    assert_eq!(last_checkpoint(&h).await, clean(day(1), day(2), None));
}

// ============================================================================
// Throttling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_throttle_waits_retries_once_and_skips_poll_delay() {
    let h = harness(
        vec![status_page(503, Some(30)), ok_page(&["oai:x:1"], None)],
        day(10),
    );
    let started = tokio::time::Instant::now();

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(!report.failed);
    assert!(report.skip_poll_delay);

    let requests = h.source.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);
    assert!(last_checkpoint(&h).await.is_clean());
}

#[tokio::test(start_paused = true)]
async fn test_second_throttle_fails_the_cycle() {
    let h = harness(
        vec![status_page(503, Some(30)), status_page(429, Some(30))],
        day(10),
    );

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(report.failed);
    assert_eq!(h.source.requests().len(), 2);

    let cp = last_checkpoint(&h).await;
    assert_eq!(cp.last_http_status, 429);
    assert!(cp.last_error.unwrap().contains("throttling"));
}

#[tokio::test]
async fn test_unavailable_without_hint_is_fatal() {
    let h = harness(vec![status_page(503, None)], day(10));

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(report.failed);
    assert!(!report.skip_poll_delay);
    assert_eq!(h.source.requests().len(), 1);
    assert_eq!(last_checkpoint(&h).await.last_http_status, 503);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_fatal_status_is_persisted_and_repeated() {
    let h = harness(vec![status_page(404, None)], day(10));

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(report.failed);
    assert_eq!(report.last_status, Some(404));

    let cp = last_checkpoint(&h).await;
    assert_eq!(cp.last_http_status, 404);
    assert_eq!(cp.last_error.as_deref(), Some("HTTP status 404"));
    assert_eq!(cp.last_from, Some(day(1)));

    assert_eq!(
        h.harvest.preview().await.unwrap(),
        PlanDecision::Repeat {
            from: Some(day(1)),
            until: Some(day(2)),
        }
    );
}

#[tokio::test]
async fn test_protocol_error_fails_with_ok_status() {
    let h = harness(
        vec![
            ok_page(&["oai:x:1"], Some("T1")),
            Ok(Page {
                status: 200,
                records: vec![],
                resumption_token: None,
                error: Some(ProtocolError {
                    code: "badResumptionToken".to_string(),
                    message: "expired".to_string(),
                }),
                retry_after: None,
            }),
        ],
        day(10),
    );

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(report.failed);
    let cp = last_checkpoint(&h).await;
    assert_eq!(cp.last_http_status, 200);
    assert_eq!(cp.resumption_token, None);
    assert_eq!(cp.last_error.as_deref(), Some("badResumptionToken: expired"));
    assert!(!cp.is_clean());
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_records_no_response() {
    let source = ScriptedSource {
        delay: Some(Duration::from_secs(120)),
        ..ScriptedSource::new(vec![ok_page(&["oai:x:1"], None)])
    };
    let h = harness_with(source, jan_1_to_2(), day(10));

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(report.failed);
    let cp = last_checkpoint(&h).await;
    assert_eq!(cp.last_http_status, NO_RESPONSE_STATUS);
    assert!(cp.last_error.unwrap().contains("timed out"));
    assert!(h.sink.committed_ids().await.is_empty());
}

#[tokio::test]
async fn test_transport_error_records_no_response() {
    let h = harness(
        vec![Err(SourceError::Transport("connection refused".to_string()))],
        day(10),
    );

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(report.failed);
    assert_eq!(report.last_status, Some(NO_RESPONSE_STATUS));
    assert!(last_checkpoint(&h)
        .await
        .last_error
        .unwrap()
        .contains("connection refused"));
}

#[tokio::test]
async fn test_failed_continuation_page_drops_the_token() {
    let h = harness(
        vec![ok_page(&["oai:x:1"], Some("T1")), status_page(404, None)],
        day(10),
    );

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(report.failed);
    let cp = last_checkpoint(&h).await;
    assert_eq!(cp.last_http_status, 404);
    assert_eq!(cp.resumption_token, None);
    assert_eq!(cp.last_from, Some(day(1)));
    assert_eq!(cp.last_until, Some(day(2)));

    let raw = h
        .store
        .get(KEY, DocumentKind::Checkpoint)
        .await
        .unwrap()
        .unwrap();
    assert!(raw["oai"].get("resumptionToken").is_none());
}

#[tokio::test]
async fn test_flush_failure_keeps_the_page_for_replay() {
    let h = harness(
        vec![
            ok_page(&["oai:x:1"], Some("T1")),
            ok_page(&["oai:x:2"], Some("T2")),
            ok_page(&["oai:x:1"], Some("T1")),
            ok_page(&["oai:x:2"], None),
        ],
        day(10),
    );
    h.sink.fail_flush_after(1);

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(report.failed);
    assert_eq!(report.pages, 2);
    let cp = last_checkpoint(&h).await;
    assert_eq!(cp.resumption_token, None);
    assert_eq!(cp.last_http_status, 200);
    assert!(cp.last_error.is_some());
    assert!(!cp.is_clean());
    assert_eq!(h.sink.committed_ids().await, vec!["oai:x:1"]);

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert_eq!(
        report.decision,
        Some(PlanDecision::Repeat {
            from: Some(day(1)),
            until: Some(day(2)),
        })
    );
    assert!(!report.failed);
    let requests = h.source.requests();
    assert_eq!(requests[2].resumption_token, None);
    assert_eq!(requests[2].from, Some(day(1)));
    assert_eq!(requests[3].resumption_token.as_deref(), Some("T1"));
    assert_eq!(h.sink.committed_ids().await, vec!["oai:x:1", "oai:x:2"]);
    assert_eq!(last_checkpoint(&h).await, clean(day(1), day(2), None));
}

// ============================================================================
// Cancellation and Store Failures
// ============================================================================

#[tokio::test]
async fn test_cancelled_before_planning_does_nothing() {
    let h = harness(vec![ok_page(&["oai:x:1"], None)], day(10));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.harvest.run_cycle(&cancel).await;

    assert!(report.cancelled);
    assert_eq!(report.decision, None);
    assert!(h.source.requests().is_empty());
    assert!(h.store.history().await.is_empty());
}

#[tokio::test]
async fn test_cancel_stops_after_persisting_current_page() {
    let cancel = CancellationToken::new();
    let source = ScriptedSource {
        cancel_on_request: Some((1, cancel.clone())),
        ..ScriptedSource::new(vec![
            ok_page(&["oai:x:1"], Some("T1")),
            ok_page(&["oai:x:2"], None),
        ])
    };
    let h = harness_with(source, jan_1_to_2(), day(10));

    let report = h.harvest.run_cycle(&cancel).await;

    assert!(report.cancelled);
    assert_eq!(h.source.requests().len(), 1);
    assert_eq!(h.sink.committed_ids().await, vec!["oai:x:1"]);
    assert_eq!(last_checkpoint(&h).await, clean(day(1), day(2), Some("T1")));

    let state = h.store.load_state(KEY).await.unwrap();
    assert!(!state.active);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_throttle_wait() {
    let h = harness(vec![status_page(503, Some(3600))], day(10));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });
    let started = tokio::time::Instant::now();

    let report = h.harvest.run_cycle(&cancel).await;

    assert!(report.cancelled);
    assert!(started.elapsed() < Duration::from_secs(3600));
    assert_eq!(h.source.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_store_unavailable_cools_down_then_plans() {
    let h = harness(vec![ok_page(&["oai:x:1"], None)], day(10));
    h.store.fail_next_loads(1);
    let started = tokio::time::Instant::now();

    let report = h.harvest.run_cycle(&CancellationToken::new()).await;

    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(matches!(report.decision, Some(PlanDecision::First { .. })));
    assert!(!report.failed);
}

#[tokio::test]
async fn test_state_counts_cycles_and_records() {
    let h = harness(
        vec![ok_page(&["oai:x:1", "oai:x:2"], None), ok_page(&[], None)],
        day(10),
    );
    let cancel = CancellationToken::new();

    h.harvest.run_cycle(&cancel).await;
    h.harvest.run_cycle(&cancel).await;

    let state = h.store.load_state(KEY).await.unwrap();
    assert_eq!(state.cycles, 2);
    assert_eq!(state.counter, 2);
    assert_eq!(state.started, Some(day(10)));
    assert!(!state.active);
}
