//! Harvester configuration
//!
//! Loaded from an optional TOML/JSON/YAML file, overlaid with `OAI_`
//! environment variables (nested keys use `__`, e.g. `OAI_SINK__URL`).
//! Every option has a default; a missing value is never an error.
//!
//! ```toml
//! [[sources]]
//! name = "arxiv-physics"
//! url = "http://export.arxiv.org/oai2"
//! set = "physics"
//! from = "2020-01-01"
//! until = "2020-01-02"
//!
//! [sink]
//! url = "http://localhost:9200"
//! max_bulk_actions = 500
//!
//! [checkpoint]
//! backend = "file"
//! dir = "/var/lib/oai-harvest"
//! ```

use crate::checkpoint::validate_key;
use crate::error::{HarvestError, Result};
use crate::planner::{StaticWindow, TimeWindowPlanner, DEFAULT_CLOCK_SKEW_SECS};
use crate::source::HarvestRequest;
use chrono::{DateTime, TimeDelta, Utc};
use oai_common::datestamp;
use oai_common::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Source Configuration Constants
// ============================================================================

/// Default repository base URL.
pub const DEFAULT_URL: &str = "http://localhost";

/// Default OAI metadata format.
pub const DEFAULT_METADATA_PREFIX: &str = "oai_dc";

/// Default delay between harvest cycles in seconds (60 minutes).
pub const DEFAULT_POLL_SECS: u64 = 3600;

/// Default page request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default pause after the checkpoint store failed to load, in seconds.
pub const DEFAULT_COOLDOWN_SECS: u64 = 60;

/// Default target index for harvested documents.
pub const DEFAULT_INDEX: &str = "oai";

// ============================================================================
// Sink Configuration Constants
// ============================================================================

/// Default bulk endpoint base URL.
pub const DEFAULT_SINK_URL: &str = "http://localhost:9200";

/// Default number of documents per bulk request.
pub const DEFAULT_MAX_BULK_ACTIONS: usize = 1000;

/// Default bulk request timeout in seconds.
pub const DEFAULT_BULK_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Checkpoint Configuration Constants
// ============================================================================

/// Default directory for file checkpoints.
pub const DEFAULT_CHECKPOINT_DIR: &str = "./checkpoints";

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_metadata_prefix() -> String {
    DEFAULT_METADATA_PREFIX.to_string()
}

fn default_poll_secs() -> u64 {
    DEFAULT_POLL_SECS
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_cooldown_secs() -> u64 {
    DEFAULT_COOLDOWN_SECS
}

fn default_clock_skew_secs() -> u64 {
    DEFAULT_CLOCK_SKEW_SECS as u64
}

fn default_index() -> String {
    DEFAULT_INDEX.to_string()
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CHECKPOINT_DIR)
}

/// Number of CPUs, the default bulk concurrency
fn default_max_concurrent_bulk_requests() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub sources: Vec<SourceConfig>,
    pub sink: SinkConfig,
    pub checkpoint: CheckpointConfig,
    pub logging: LogConfig,
}

/// One OAI-PMH repository to harvest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Checkpoint key; derived from the URL and set when absent
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub set: Option<String>,

    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,

    /// Initial window lower bound (`YYYY-MM-DD` or `YYYY-MM-DDThh:mm:ssZ`)
    #[serde(
        default,
        with = "datestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub from: Option<DateTime<Utc>>,

    /// Initial window upper bound
    #[serde(
        default,
        with = "datestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub until: Option<DateTime<Utc>>,

    /// Delay between cycles when no `schedule` is given
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,

    /// Cron expression with seconds (e.g. "0 0 2 * * *"); overrides `poll_secs`
    #[serde(default)]
    pub schedule: Option<String>,

    #[serde(default)]
    pub proxy_host: Option<String>,

    #[serde(default)]
    pub proxy_port: u16,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_index")]
    pub index: String,

    /// Optional `_type` for bulk actions
    #[serde(default, rename = "type")]
    pub doc_type: Option<String>,

    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: None,
            url: default_url(),
            set: None,
            metadata_prefix: default_metadata_prefix(),
            from: None,
            until: None,
            poll_secs: DEFAULT_POLL_SECS,
            schedule: None,
            proxy_host: None,
            proxy_port: 0,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            index: default_index(),
            doc_type: None,
            clock_skew_secs: default_clock_skew_secs(),
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }
}

impl SourceConfig {
    /// Overlay single-source settings from `OAI_*` environment variables.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var("OAI_URL") {
            self.url = url;
        }
        if let Ok(set) = std::env::var("OAI_SET") {
            self.set = Some(set).filter(|s| !s.is_empty());
        }
        if let Ok(prefix) = std::env::var("OAI_METADATA_PREFIX") {
            self.metadata_prefix = prefix;
        }
        if let Ok(from) = std::env::var("OAI_FROM") {
            self.from = Some(datestamp::parse(&from)?);
        }
        if let Ok(until) = std::env::var("OAI_UNTIL") {
            self.until = Some(datestamp::parse(&until)?);
        }
        if let Ok(host) = std::env::var("OAI_PROXY_HOST") {
            self.proxy_host = Some(host).filter(|h| !h.is_empty());
        }
        self.poll_secs = std::env::var("OAI_POLL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.poll_secs);
        self.timeout_secs = std::env::var("OAI_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.timeout_secs);
        self.proxy_port = std::env::var("OAI_PROXY_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.proxy_port);
        Ok(self)
    }

    /// Stable checkpoint key for this source
    pub fn key(&self) -> String {
        if let Some(ref name) = self.name {
            return name.clone();
        }

        let base = url::Url::parse(&self.url)
            .map(|u| format!("{}{}", u.host_str().unwrap_or("oai"), u.path()))
            .unwrap_or_else(|_| self.url.clone());
        let raw = match self.set {
            Some(ref set) => format!("{}-{}", base, set),
            None => base,
        };

        let slug: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        slug.trim_matches(|c| c == '-' || c == '.').to_string()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// `http://host[:port]` when a proxy host is configured
    pub fn proxy_url(&self) -> Option<String> {
        let host = self.proxy_host.as_deref()?;
        Some(match self.proxy_port {
            0 => format!("http://{}", host),
            port => format!("http://{}:{}", host, port),
        })
    }

    pub fn static_window(&self) -> StaticWindow {
        StaticWindow {
            from: self.from,
            until: self.until,
        }
    }

    /// Margin kept between a window's upper bound and now, `None` when
    /// `clock_skew_secs` is too large to represent.
    pub fn clock_skew(&self) -> Option<TimeDelta> {
        i64::try_from(self.clock_skew_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
    }

    pub fn planner(&self) -> TimeWindowPlanner {
        let skew = self
            .clock_skew()
            .unwrap_or_else(|| TimeDelta::seconds(DEFAULT_CLOCK_SKEW_SECS));
        TimeWindowPlanner::new(self.static_window()).with_clock_skew(skew)
    }

    /// Request carrying this source's fixed parameters; the planner fills
    /// in window and token.
    pub fn request_template(&self) -> HarvestRequest {
        HarvestRequest {
            url: self.url.clone(),
            set: self.set.clone(),
            metadata_prefix: self.metadata_prefix.clone(),
            from: None,
            until: None,
            resumption_token: None,
        }
    }

    pub fn cron_schedule(&self) -> Result<Option<cron::Schedule>> {
        self.schedule
            .as_deref()
            .map(|expr| {
                cron::Schedule::from_str(expr).map_err(|e| {
                    HarvestError::config(format!(
                        "source '{}': invalid schedule '{}': {}",
                        self.key(),
                        expr,
                        e
                    ))
                })
            })
            .transpose()
    }

    pub fn validate(&self) -> Result<()> {
        let key = self.key();

        validate_key(&key).map_err(|e| {
            HarvestError::config(format!("{}; set an explicit `name` for {}", e, self.url))
        })?;

        let url = url::Url::parse(&self.url).map_err(|e| {
            HarvestError::config(format!("source '{}': invalid url '{}': {}", key, self.url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HarvestError::config(format!(
                "source '{}': url must be http or https",
                key
            )));
        }

        if self.metadata_prefix.trim().is_empty() {
            return Err(HarvestError::config(format!(
                "source '{}': metadata_prefix must not be empty",
                key
            )));
        }

        if let (Some(from), Some(until)) = (self.from, self.until) {
            if from > until {
                return Err(HarvestError::config(format!(
                    "source '{}': from ({}) is after until ({})",
                    key,
                    datestamp::format(&from),
                    datestamp::format(&until)
                )));
            }
        }

        if self.timeout_secs == 0 {
            return Err(HarvestError::config(format!(
                "source '{}': timeout_secs must be greater than 0",
                key
            )));
        }

        if self.clock_skew().is_none() {
            return Err(HarvestError::config(format!(
                "source '{}': clock_skew_secs {} is out of range",
                key, self.clock_skew_secs
            )));
        }

        if self.schedule.is_none() && self.poll_secs == 0 {
            return Err(HarvestError::config(format!(
                "source '{}': poll_secs must be greater than 0",
                key
            )));
        }

        self.cron_schedule()?;
        Ok(())
    }
}

/// Bulk sink settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Base URL; documents are posted to `<url>/_bulk`
    pub url: String,
    pub max_bulk_actions: usize,
    pub max_concurrent_bulk_requests: usize,
    pub bulk_timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SINK_URL.to_string(),
            max_bulk_actions: DEFAULT_MAX_BULK_ACTIONS,
            max_concurrent_bulk_requests: default_max_concurrent_bulk_requests(),
            bulk_timeout_secs: DEFAULT_BULK_TIMEOUT_SECS,
        }
    }
}

impl SinkConfig {
    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_bulk_actions == 0 {
            return Err(HarvestError::config(
                "sink.max_bulk_actions must be greater than 0",
            ));
        }
        if self.max_concurrent_bulk_requests == 0 {
            return Err(HarvestError::config(
                "sink.max_concurrent_bulk_requests must be greater than 0",
            ));
        }
        if self.bulk_timeout_secs == 0 {
            return Err(HarvestError::config(
                "sink.bulk_timeout_secs must be greater than 0",
            ));
        }
        url::Url::parse(&self.url)
            .map_err(|e| HarvestError::config(format!("sink.url '{}': {}", self.url, e)))?;
        Ok(())
    }
}

/// Where checkpoints are kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CheckpointConfig {
    /// JSON files under `dir`
    File {
        #[serde(default = "default_checkpoint_dir")]
        dir: PathBuf,
    },
    /// Process memory; progress is lost on exit
    Memory,
    /// PostgreSQL table (requires the `database` feature)
    Postgres { url: String },
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig::File {
            dir: default_checkpoint_dir(),
        }
    }
}

impl HarvestConfig {
    /// Load from an optional file plus environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("OAI")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut loaded: HarvestConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| HarvestError::config(e.to_string()))?;

        if loaded.sources.is_empty() {
            loaded.sources.push(SourceConfig::default().with_env_overrides()?);
        }
        loaded.logging = loaded.logging.with_env_overrides()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse a TOML document without touching the environment.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let loaded: HarvestConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| HarvestError::config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        let mut keys = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !keys.insert(source.key()) {
                return Err(HarvestError::config(format!(
                    "duplicate source name '{}'; give each source a distinct `name`",
                    source.key()
                )));
            }
        }

        self.sink.validate()?;

        if let CheckpointConfig::Postgres { ref url } = self.checkpoint {
            if url.is_empty() {
                return Err(HarvestError::config("checkpoint.url must not be empty"));
            }
        }

        Ok(())
    }

    /// Sources selected by name, or all of them
    pub fn select(&self, name: Option<&str>) -> Result<Vec<SourceConfig>> {
        match name {
            None => Ok(self.sources.clone()),
            Some(name) => {
                let selected: Vec<SourceConfig> = self
                    .sources
                    .iter()
                    .filter(|s| s.key() == name)
                    .cloned()
                    .collect();
                if selected.is_empty() {
                    return Err(HarvestError::config(format!("no source named '{}'", name)));
                }
                Ok(selected)
            }
        }
    }
}

/// Annotated configuration printed by `oai-harvest example`
pub const EXAMPLE_CONFIG: &str = r#"# OAI-PMH harvester configuration

[[sources]]
# Checkpoint key; defaults to a slug of url + set
name = "arxiv-physics"
url = "http://export.arxiv.org/oai2"
set = "physics"
metadata_prefix = "oai_dc"
# Initial window; omitted bounds are open
from = "2020-01-01"
until = "2020-01-02"
# Either a fixed delay between cycles...
poll_secs = 3600
# ...or a cron expression with seconds
# schedule = "0 0 2 * * *"
timeout_secs = 60
# proxy_host = "proxy.local"
# proxy_port = 3128
index = "oai"

[sink]
url = "http://localhost:9200"
max_bulk_actions = 1000
max_concurrent_bulk_requests = 4
bulk_timeout_secs = 60

[checkpoint]
backend = "file"
dir = "./checkpoints"

[logging]
level = "info"
output = "console"
format = "text"
"#;
