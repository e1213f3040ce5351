//! `oai-harvest status` command implementation
//!
//! Shows the stored checkpoint and harvest state of each source.

use crate::checkpoint::{Checkpoint, HarvestState};
use crate::config::HarvestConfig;
use crate::error::Result;
use crate::runtime::{open_store, SharedStore};
use colored::Colorize;
use oai_common::datestamp;

/// Stored documents for one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub key: String,
    pub checkpoint: Option<Checkpoint>,
    pub state: HarvestState,
}

pub async fn collect(config: &HarvestConfig, store: &SharedStore) -> Result<Vec<SourceStatus>> {
    let mut out = Vec::with_capacity(config.sources.len());

    for source in &config.sources {
        let key = source.key();
        let checkpoint = store.load(&key).await?;
        let state = store.load_state(&key).await?;
        out.push(SourceStatus {
            key,
            checkpoint,
            state,
        });
    }

    Ok(out)
}

pub async fn run(config: HarvestConfig) -> Result<()> {
    let store = open_store(&config.checkpoint).await?;
    let statuses = collect(&config, &store).await?;

    for status in &statuses {
        println!("{}", status.key.cyan().bold());

        match status.checkpoint {
            None => println!("  Checkpoint: {}", "never harvested".yellow()),
            Some(ref cp) => {
                let health = if cp.is_clean() {
                    "ok".green()
                } else {
                    "failed".red()
                };
                println!("  Checkpoint: {}", health);
                println!("  Window:     [{}, {}]", bound(&cp.last_from), bound(&cp.last_until));
                println!("  Status:     {}", cp.last_http_status);
                if let Some(ref token) = cp.resumption_token {
                    println!("  Token:      {}", token);
                }
                if let Some(ref error) = cp.last_error {
                    println!("  Error:      {}", error.red());
                }
            }
        }

        println!("  Cycles:     {}", status.state.cycles);
        println!("  Records:    {}", status.state.counter);
        println!("  Started:    {}", bound(&status.state.started));
        println!("  Last run:   {}", bound(&status.state.timestamp));
        if status.state.active {
            println!("  {}", "Cycle in progress (or interrupted)".yellow());
        }
        println!();
    }

    Ok(())
}

fn bound(ts: &Option<chrono::DateTime<chrono::Utc>>) -> String {
    ts.as_ref()
        .map(datestamp::format)
        .unwrap_or_else(|| "-".to_string())
}
