//! Wiring from configuration to running harvest loops

use crate::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::config::{CheckpointConfig, HarvestConfig, SourceConfig};
use crate::error::{HarvestError, Result};
use crate::harvester::{HarvestLoop, LoopSettings};
use crate::scheduler::{SourceRunner, Trigger};
use crate::sink::{BulkSink, HttpBulkSink, MemorySink};
use crate::source::HttpOaiSource;
use crate::transform::JsonDocumentTransformer;
use std::sync::Arc;
use tracing::info;

pub type SharedStore = Arc<dyn CheckpointStore>;
pub type SharedSink = Arc<dyn BulkSink>;

/// Harvest loop as assembled from configuration
pub type ConfiguredLoop = HarvestLoop<HttpOaiSource, JsonDocumentTransformer, SharedSink, SharedStore>;

/// Source runner as assembled from configuration
pub type ConfiguredRunner =
    SourceRunner<HttpOaiSource, JsonDocumentTransformer, SharedSink, SharedStore>;

/// Open the configured checkpoint backend.
pub async fn open_store(config: &CheckpointConfig) -> Result<SharedStore> {
    match config {
        CheckpointConfig::File { dir } => {
            info!(dir = %dir.display(), "Using file checkpoint store");
            Ok(Arc::new(FileCheckpointStore::new(dir.clone())))
        }
        CheckpointConfig::Memory => {
            info!("Using in-memory checkpoint store; progress is lost on exit");
            Ok(Arc::new(MemoryCheckpointStore::new()))
        }
        #[cfg(feature = "database")]
        CheckpointConfig::Postgres { url } => {
            info!("Using PostgreSQL checkpoint store");
            let store = crate::checkpoint::PgCheckpointStore::connect(url).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "database"))]
        CheckpointConfig::Postgres { .. } => Err(HarvestError::config(
            "checkpoint backend 'postgres' requires the `database` feature",
        )),
    }
}

/// Assembles harvest loops sharing one store and one HTTP client
pub struct Runtime {
    config: HarvestConfig,
    store: SharedStore,
    client: reqwest::Client,
    dry_run: bool,
}

impl Runtime {
    pub async fn new(config: HarvestConfig, dry_run: bool) -> Result<Self> {
        let store = open_store(&config.checkpoint).await?;
        Ok(Self::with_store(config, store, dry_run))
    }

    pub fn with_store(config: HarvestConfig, store: SharedStore, dry_run: bool) -> Self {
        Self {
            config,
            store,
            client: reqwest::Client::new(),
            dry_run,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Sink for one source; documents are only kept in memory on a dry run.
    fn sink(&self) -> Result<SharedSink> {
        if self.dry_run {
            return Ok(Arc::new(MemorySink::new()));
        }
        let sink = HttpBulkSink::with_client(self.client.clone(), &self.config.sink)?;
        Ok(Arc::new(sink))
    }

    pub fn harvest_loop(&self, source: &SourceConfig) -> Result<ConfiguredLoop> {
        let settings = LoopSettings::from_config(source);
        let oai = HttpOaiSource::new(source)?;
        let transformer = JsonDocumentTransformer::new(source.index.clone(), source.doc_type.clone());

        Ok(HarvestLoop::new(
            settings,
            oai,
            transformer,
            self.sink()?,
            Arc::clone(&self.store),
        ))
    }

    /// Runners for the selected source, or all of them.
    pub fn runners(&self, name: Option<&str>) -> Result<Vec<ConfiguredRunner>> {
        self.config
            .select(name)?
            .iter()
            .map(|source| {
                let trigger = Trigger::from_config(source)?;
                Ok(SourceRunner::new(self.harvest_loop(source)?, trigger))
            })
            .collect::<std::result::Result<Vec<_>, HarvestError>>()
    }
}
