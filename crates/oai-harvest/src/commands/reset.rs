//! `oai-harvest reset` command implementation
//!
//! Deletes a source's checkpoint so its next cycle starts from the
//! configured window. Harvest state is kept.

use crate::config::HarvestConfig;
use crate::error::Result;
use crate::runtime::open_store;
use colored::Colorize;
use tracing::info;

pub async fn run(config: HarvestConfig, source: &str) -> Result<()> {
    let selected = config.select(Some(source))?;
    let store = open_store(&config.checkpoint).await?;

    for source in selected {
        let key = source.key();
        if store.reset(&key).await? {
            info!(source = %key, "Checkpoint removed");
            println!("{} {}", "Reset".green().bold(), key);
        } else {
            println!("{} {} (no checkpoint)", "Unchanged".yellow(), key);
        }
    }

    Ok(())
}
