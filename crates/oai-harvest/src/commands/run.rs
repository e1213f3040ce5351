//! `oai-harvest run` command implementation
//!
//! Starts one scheduler task per source and waits until they stop.

use crate::config::HarvestConfig;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::scheduler::{run_all, RunSummary};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Harvest the selected sources until `cancel` fires, or one cycle each
/// when `once` is set.
pub async fn run(
    config: HarvestConfig,
    source: Option<&str>,
    once: bool,
    dry_run: bool,
    cancel: CancellationToken,
) -> Result<Vec<RunSummary>> {
    let runtime = Runtime::new(config, dry_run).await?;
    let runners = runtime.runners(source)?;

    info!(
        sources = runners.len(),
        once = once,
        dry_run = dry_run,
        "Starting harvest"
    );

    let summaries = run_all(runners, cancel, once).await;

    for summary in &summaries {
        info!(
            source = %summary.source,
            cycles = summary.cycles,
            failed_cycles = summary.failed_cycles,
            records = summary.records,
            documents = summary.documents,
            "Harvest summary"
        );
    }

    Ok(summaries)
}
