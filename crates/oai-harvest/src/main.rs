//! OAI Harvest - Main entry point

use anyhow::Context;
use clap::Parser;
use oai_common::logging::{init_logging, LogLevel};
use oai_harvest::commands;
use oai_harvest::{Cli, Commands, HarvestConfig};
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Commands::Example = cli.command {
        commands::example::run();
        return;
    }

    if let Err(e) = execute(cli).await {
        error!(error = %format!("{:#}", e), "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let mut config =
        HarvestConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if cli.verbose {
        config.logging.level = LogLevel::Debug;
    }

    // Keep the guard alive so buffered file logs are written on exit
    let _log_guard = init_logging(&config.logging).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Run {
            source,
            once,
            dry_run,
        } => {
            let cancel = CancellationToken::new();
            spawn_shutdown_handler(cancel.clone());

            let summaries = commands::run::run(config, source.as_deref(), once, dry_run, cancel)
                .await
                .context("Harvest failed")?;

            if once && summaries.iter().any(|s| s.failed_cycles > 0) {
                anyhow::bail!("one or more sources failed");
            }
            Ok(())
        }
        Commands::Plan { source } => commands::plan::run(config, source.as_deref())
            .await
            .context("Failed to plan"),
        Commands::Status => commands::status::run(config)
            .await
            .context("Failed to read status"),
        Commands::Reset { source } => commands::reset::run(config, &source)
            .await
            .with_context(|| format!("Failed to reset '{}'", source)),
        Commands::Example => {
            commands::example::run();
            Ok(())
        }
    }
}

/// Cancel the harvest on Ctrl-C; a running page is persisted first.
fn spawn_shutdown_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing current page");
                cancel.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });
}
