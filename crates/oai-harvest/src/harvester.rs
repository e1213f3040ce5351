//! Harvest loop
//!
//! One [`HarvestLoop`] drives one source through a single cycle:
//!
//! ```text
//! Idle -> Planning -> Requesting -> PageSuccess | PageFailure -> Persisting
//!                         ^                                          |
//!                         +------ next token, no failure, not cancelled
//! ```
//!
//! Every page attempt ends in Persisting: the sink is flushed first and the
//! checkpoint written second, so a checkpoint never claims progress the
//! sink has not acknowledged. A crash between the two replays the page on
//! restart (at-least-once delivery; documents are upserted by id).

use crate::checkpoint::{Checkpoint, CheckpointStore, HarvestState, OK_STATUS};
use crate::classify::{classify, PageOutcome};
use crate::config::SourceConfig;
use crate::error::{SinkError, SourceError};
use crate::planner::{PlanDecision, TimeWindowPlanner};
use crate::scheduler::sleep_or_cancel;
use crate::sink::BulkSink;
use crate::source::{HarvestRequest, OaiSource, Page, Record};
use crate::transform::RecordTransformer;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Source of the current time; replaceable for tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Per-source loop settings
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Checkpoint key
    pub key: String,
    /// Fixed request parameters (url, set, metadata prefix)
    pub template: HarvestRequest,
    pub planner: TimeWindowPlanner,
    /// Upper bound for one page request
    pub timeout: Duration,
    /// Pause after the checkpoint store failed to load
    pub cooldown: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            key: config.key(),
            template: config.request_template(),
            planner: config.planner(),
            timeout: config.timeout(),
            cooldown: config.cooldown(),
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// `None` when the cycle was cancelled before planning finished
    pub decision: Option<PlanDecision>,
    pub pages: usize,
    pub records: u64,
    pub documents: u64,
    /// Records the transformer rejected
    pub skipped: u64,
    pub last_status: Option<i32>,
    pub error: Option<String>,
    pub failed: bool,
    pub cancelled: bool,
    /// A throttle wait was already served; the scheduler should not wait again
    pub skip_poll_delay: bool,
}

/// Page-level result handed to Persisting
struct Attempt {
    status: i32,
    error: Option<String>,
    next_token: Option<String>,
}

/// Drives harvest cycles for one source
pub struct HarvestLoop<S, T, K, C> {
    settings: LoopSettings,
    source: S,
    transformer: T,
    sink: K,
    store: C,
    clock: Clock,
}

impl<S, T, K, C> HarvestLoop<S, T, K, C>
where
    S: OaiSource,
    T: RecordTransformer,
    K: BulkSink,
    C: CheckpointStore,
{
    pub fn new(settings: LoopSettings, source: S, transformer: T, sink: K, store: C) -> Self {
        Self {
            settings,
            source,
            transformer,
            sink,
            store,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn key(&self) -> &str {
        &self.settings.key
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Decide what the next cycle would request, without side effects.
    pub async fn preview(&self) -> Result<PlanDecision, crate::error::StoreError> {
        let checkpoint = self.store.load(&self.settings.key).await?;
        Ok(self
            .settings
            .planner
            .plan(checkpoint.as_ref(), (self.clock)()))
    }

    /// Run one cycle: plan, then page until done, failed or cancelled.
    #[instrument(skip_all, fields(source = %self.settings.key))]
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();

        let Some(checkpoint) = self.load_checkpoint(cancel).await else {
            report.cancelled = true;
            return report;
        };

        let decision = self
            .settings
            .planner
            .plan(checkpoint.as_ref(), (self.clock)());
        report.decision = Some(decision.clone());

        let Some(mut request) = decision.to_request(&self.settings.template) else {
            debug!("Window not yet closed, nothing to harvest");
            return report;
        };

        info!(decision = %decision, "Harvest cycle started");
        let mut state = self.begin_state().await;

        loop {
            if cancel.is_cancelled() {
                info!("Harvest cancelled before next page");
                report.cancelled = true;
                break;
            }

            let Some(attempt) = self.attempt_page(&request, cancel, &mut report).await else {
                report.cancelled = true;
                break;
            };

            let attempt = self.persist(&request, attempt).await;

            report.last_status = Some(attempt.status);
            if let Some(ref error) = attempt.error {
                error!(
                    status = attempt.status,
                    error = %error,
                    request = %request,
                    "Harvest cycle aborted"
                );
                report.error = Some(error.clone());
                report.failed = true;
                break;
            }

            match attempt.next_token {
                Some(token) => {
                    debug!(token = %token, "Following resumption token");
                    request = request.continue_with(token);
                }
                None => break,
            }
        }

        self.finish_state(&mut state, report.records).await;

        info!(
            pages = report.pages,
            records = report.records,
            documents = report.documents,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            "Harvest cycle finished"
        );
        report
    }

    /// Planning input. Retries after a cool-down while the store is
    /// unavailable; `None` only when cancelled.
    async fn load_checkpoint(&self, cancel: &CancellationToken) -> Option<Option<Checkpoint>> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            match self.store.load(&self.settings.key).await {
                Ok(checkpoint) => return Some(checkpoint),
                Err(e) => {
                    warn!(
                        error = %e,
                        cooldown_secs = self.settings.cooldown.as_secs(),
                        "Failed to load checkpoint, cooling down"
                    );
                    if !sleep_or_cancel(self.settings.cooldown, cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Requesting plus PageSuccess/PageFailure. `None` when cancelled while
    /// serving a throttle wait.
    ///
    /// That is the one attempt that never reaches Persisting: the throttled
    /// response is dropped without a checkpoint write, and the last stored
    /// checkpoint drives the next plan.
    async fn attempt_page(
        &self,
        request: &HarvestRequest,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Option<Attempt> {
        let mut result = self.request_page(request).await;
        report.pages += 1;
        let mut outcome = classify(&result);

        if let PageOutcome::Throttled(wait) = outcome {
            info!(wait_secs = wait.as_secs(), "Repository asked us to wait");
            if !sleep_or_cancel(wait, cancel).await {
                return None;
            }
            report.skip_poll_delay = true;

            result = self.request_page(request).await;
            report.pages += 1;
            outcome = match classify(&result) {
                PageOutcome::Throttled(_) => PageOutcome::Failed {
                    status: result.as_ref().map(|p| i32::from(p.status)).unwrap_or(-1),
                    error: "repository still throttling after retry".to_string(),
                },
                other => other,
            };
        }

        let attempt = match (outcome, result) {
            (PageOutcome::Success, Ok(page)) => {
                let Page {
                    status,
                    records,
                    resumption_token,
                    ..
                } = page;
                let status = i32::from(status);
                match self.route(records, report).await {
                    Ok(()) => Attempt {
                        status,
                        error: None,
                        next_token: resumption_token,
                    },
                    Err(e) => Attempt {
                        status,
                        error: Some(e.to_string()),
                        next_token: None,
                    },
                }
            }
            (PageOutcome::Failed { status, error }, _) => Attempt {
                status,
                error: Some(error),
                next_token: None,
            },
            (outcome, result) => Attempt {
                status: result.as_ref().map(|p| i32::from(p.status)).unwrap_or(-1),
                error: Some(format!("unexpected page outcome {:?}", outcome)),
                next_token: None,
            },
        };

        Some(attempt)
    }

    async fn request_page(&self, request: &HarvestRequest) -> Result<Page, SourceError> {
        debug!(request = %request, "Requesting page");
        match tokio::time::timeout(self.settings.timeout, self.source.list_records(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(self.settings.timeout)),
        }
    }

    /// Transform and index records in source order.
    async fn route(&self, records: Vec<Record>, report: &mut CycleReport) -> Result<(), SinkError> {
        for record in records {
            report.records += 1;
            match self.transformer.transform(&record) {
                Ok(documents) => {
                    for document in documents {
                        self.sink.index(document).await?;
                        report.documents += 1;
                    }
                }
                Err(e) => {
                    report.skipped += 1;
                    warn!(identifier = %e.identifier, error = %e, "Skipping record");
                }
            }
        }
        Ok(())
    }

    /// Flush, then write the checkpoint for this attempt.
    ///
    /// A failed flush or save turns the attempt into a failure. The
    /// checkpoint only carries a token when the page was clean; a failed
    /// attempt records its window so the planner repeats it from the start.
    async fn persist(&self, request: &HarvestRequest, mut attempt: Attempt) -> Attempt {
        if let Err(e) = self.sink.flush().await {
            warn!(error = %e, "Bulk flush failed, page will be harvested again");
            attempt.error.get_or_insert_with(|| e.to_string());
        }

        let clean = attempt.error.is_none() && attempt.status == OK_STATUS;
        let checkpoint = Checkpoint {
            resumption_token: if clean {
                attempt.next_token.clone()
            } else {
                None
            },
            last_from: request.from,
            last_until: request.until,
            last_error: attempt.error.clone(),
            last_http_status: attempt.status,
        };

        if let Err(e) = self.store.save(&self.settings.key, &checkpoint).await {
            error!(error = %e, "Failed to save checkpoint");
            attempt.error.get_or_insert_with(|| e.to_string());
        }

        if !clean {
            attempt.next_token = None;
        }
        attempt
    }

    async fn begin_state(&self) -> HarvestState {
        let mut state = match self.store.load_state(&self.settings.key).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Failed to load harvest state, starting fresh");
                HarvestState::default()
            }
        };
        state.begin((self.clock)());
        if let Err(e) = self.store.save_state(&self.settings.key, &state).await {
            warn!(error = %e, "Failed to save harvest state");
        }
        state
    }

    async fn finish_state(&self, state: &mut HarvestState, records: u64) {
        state.finish((self.clock)(), records);
        if let Err(e) = self.store.save_state(&self.settings.key, state).await {
            warn!(error = %e, "Failed to save harvest state");
        }
    }
}
