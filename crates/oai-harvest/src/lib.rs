//! OAI-PMH incremental harvester
//!
//! Harvests metadata records from OAI-PMH repositories with `ListRecords`,
//! turns them into JSON documents and writes them to a bulk indexing
//! endpoint, remembering its progress in a checkpoint after every page.
//!
//! # Overview
//!
//! - **Planning**: [`planner`] decides from the last checkpoint whether to
//!   resume a token, advance the time window, repeat it, or wait
//! - **Harvesting**: [`harvester`] pages through one window, flushing the
//!   sink before every checkpoint write
//! - **Scheduling**: [`scheduler`] runs one loop per source on an interval
//!   or cron schedule until cancelled
//! - **Collaborators**: [`source`], [`transform`], [`sink`] and
//!   [`checkpoint`] are traits with HTTP, file, memory and PostgreSQL
//!   implementations

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checkpoint;
pub mod classify;
pub mod commands;
pub mod config;
pub mod error;
pub mod harvester;
pub mod planner;
pub mod runtime;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod transform;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointStore, HarvestState};
pub use config::{HarvestConfig, SourceConfig};
pub use error::{HarvestError, Result};
pub use harvester::{CycleReport, HarvestLoop, LoopSettings};
pub use planner::{PlanDecision, TimeWindowPlanner};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// OAI-PMH incremental harvester
#[derive(Parser, Debug)]
#[command(name = "oai-harvest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, env = "OAI_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Harvest configured sources until interrupted
    Run {
        /// Only harvest the source with this name
        #[arg(short, long)]
        source: Option<String>,

        /// Run a single cycle per source and exit
        #[arg(long)]
        once: bool,

        /// Keep documents in memory instead of sending them to the sink
        #[arg(long)]
        dry_run: bool,
    },

    /// Show what the next cycle would request
    Plan {
        /// Only plan the source with this name
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Show stored checkpoints and harvest state
    Status,

    /// Delete a source's checkpoint
    Reset {
        /// Source name
        #[arg(short, long)]
        source: String,
    },

    /// Print an example configuration file
    Example,
}
