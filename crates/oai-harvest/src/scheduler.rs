//! Cycle scheduling
//!
//! Each source runs on its own task: an interval trigger harvests at once
//! and then sleeps `poll_secs` between cycles; a cron trigger sleeps until
//! the next fire time before every cycle. All waits end early on
//! cancellation.

use crate::checkpoint::CheckpointStore;
use crate::config::SourceConfig;
use crate::error::Result;
use crate::harvester::{CycleReport, HarvestLoop};
use crate::sink::BulkSink;
use crate::source::OaiSource;
use crate::transform::RecordTransformer;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sleep for `duration` unless cancelled first. Returns `true` when the
/// full duration elapsed.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// When the next cycle of a source starts
#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(Duration),
    Cron(Box<cron::Schedule>),
}

impl Trigger {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        Ok(match config.cron_schedule()? {
            Some(schedule) => Trigger::Cron(Box::new(schedule)),
            None => Trigger::Interval(config.poll()),
        })
    }

    /// Delay before the next cycle, `None` when a cron schedule has no
    /// future fire time.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Trigger::Interval(every) => Some(*every),
            Trigger::Cron(schedule) => schedule
                .after(&now)
                .next()
                .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO)),
        }
    }

    fn is_interval(&self) -> bool {
        matches!(self, Trigger::Interval(_))
    }
}

/// Totals for one source over the lifetime of its runner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub source: String,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub records: u64,
    pub documents: u64,
}

impl RunSummary {
    fn absorb(&mut self, report: &CycleReport) {
        if report.decision.as_ref().is_some_and(|d| !d.is_wait()) {
            self.cycles += 1;
        }
        if report.failed {
            self.failed_cycles += 1;
        }
        self.records += report.records;
        self.documents += report.documents;
    }
}

/// Repeats harvest cycles for one source on its trigger
pub struct SourceRunner<S, T, K, C> {
    harvest: HarvestLoop<S, T, K, C>,
    trigger: Trigger,
}

impl<S, T, K, C> SourceRunner<S, T, K, C>
where
    S: OaiSource,
    T: RecordTransformer,
    K: BulkSink,
    C: CheckpointStore,
{
    pub fn new(harvest: HarvestLoop<S, T, K, C>, trigger: Trigger) -> Self {
        Self { harvest, trigger }
    }

    /// Run a single cycle, then close the sink.
    pub async fn run_once(&self, cancel: &CancellationToken) -> RunSummary {
        let mut summary = RunSummary {
            source: self.harvest.key().to_string(),
            ..RunSummary::default()
        };
        let report = self.harvest.run_cycle(cancel).await;
        summary.absorb(&report);
        self.close_sink().await;
        summary
    }

    /// Run cycles until cancelled.
    pub async fn run(&self, cancel: &CancellationToken) -> RunSummary {
        let mut summary = RunSummary {
            source: self.harvest.key().to_string(),
            ..RunSummary::default()
        };
        info!(source = %summary.source, trigger = ?self.trigger, "Source runner started");

        if !self.trigger.is_interval() && !self.wait_for_next(cancel, false).await {
            self.close_sink().await;
            return summary;
        }

        loop {
            let report = self.harvest.run_cycle(cancel).await;
            summary.absorb(&report);

            if report.cancelled || cancel.is_cancelled() {
                break;
            }
            if !self.wait_for_next(cancel, report.skip_poll_delay).await {
                break;
            }
        }

        self.close_sink().await;
        info!(
            source = %summary.source,
            cycles = summary.cycles,
            failed_cycles = summary.failed_cycles,
            records = summary.records,
            "Source runner stopped"
        );
        summary
    }

    /// `false` when the runner should stop.
    async fn wait_for_next(&self, cancel: &CancellationToken, skip_poll_delay: bool) -> bool {
        if skip_poll_delay && self.trigger.is_interval() {
            debug!(source = %self.harvest.key(), "Throttle wait already served, skipping poll delay");
            return !cancel.is_cancelled();
        }

        match self.trigger.next_delay(Utc::now()) {
            Some(delay) => {
                debug!(source = %self.harvest.key(), delay_secs = delay.as_secs(), "Sleeping until next cycle");
                sleep_or_cancel(delay, cancel).await
            }
            None => {
                warn!(source = %self.harvest.key(), "Schedule has no future fire time");
                false
            }
        }
    }

    async fn close_sink(&self) {
        if let Err(e) = self.harvest.sink().close().await {
            error!(source = %self.harvest.key(), error = %e, "Failed to close sink");
        }
    }
}

/// Run every source concurrently until cancelled, or once each when `once`.
pub async fn run_all<S, T, K, C>(
    runners: Vec<SourceRunner<S, T, K, C>>,
    cancel: CancellationToken,
    once: bool,
) -> Vec<RunSummary>
where
    S: OaiSource + 'static,
    T: RecordTransformer + 'static,
    K: BulkSink + 'static,
    C: CheckpointStore + 'static,
{
    let handles = runners.into_iter().map(|runner| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if once {
                runner.run_once(&cancel).await
            } else {
                runner.run(&cancel).await
            }
        })
    });

    join_all(handles)
        .await
        .into_iter()
        .filter_map(|joined| match joined {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(error = %e, "Source task panicked");
                None
            }
        })
        .collect()
}
