//! `oai-harvest plan` command implementation
//!
//! Prints what the next cycle would request for each source. Reads
//! checkpoints only; no repository is contacted.

use crate::config::HarvestConfig;
use crate::error::Result;
use crate::planner::PlanDecision;
use crate::runtime::{open_store, SharedStore};
use chrono::Utc;
use colored::Colorize;

/// Planner decision per source key, in configuration order
pub async fn decisions(
    config: &HarvestConfig,
    store: &SharedStore,
    source: Option<&str>,
) -> Result<Vec<(String, PlanDecision)>> {
    let now = Utc::now();
    let mut out = Vec::new();

    for source in config.select(source)? {
        let key = source.key();
        let checkpoint = store.load(&key).await?;
        out.push((key, source.planner().plan(checkpoint.as_ref(), now)));
    }

    Ok(out)
}

pub async fn run(config: HarvestConfig, source: Option<&str>) -> Result<()> {
    let store = open_store(&config.checkpoint).await?;

    for (key, decision) in decisions(&config, &store, source).await? {
        let decision = if decision.is_wait() {
            decision.to_string().yellow()
        } else {
            decision.to_string().green()
        };
        println!("{}  {}", key.cyan().bold(), decision);
    }

    Ok(())
}
