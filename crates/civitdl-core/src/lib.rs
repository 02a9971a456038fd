//! civitdl Core - Batch Download Engine
//!
//! This crate provides the core download functionality for civitdl.
//! It enumerates assets from the remote API, downloads them with resume and
//! checksum verification, and keeps per-asset state in SQLite so a run can
//! be interrupted and picked up again.

mod api;
pub mod engine;
mod error;
mod queue;
mod storage;
mod transport;

pub use api::*;
pub use engine::{
    ClaimOutcome, FailOutcome, Orchestrator, ProgressCounters, RateLimiter, RetryPolicy,
    RunOptions, StateStore,
};
pub use error::*;
pub use queue::*;
pub use storage::*;
pub use transport::*;

use civitdl_types::{
    AssetStatus, AssetVersion, Config, EngineEvent, ProgressSnapshot, RunSummary, Selection,
    StatusCounts,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// The main civitdl core instance
#[derive(Clone)]
pub struct CivitdlCore {
    config: Config,
    storage: ConfigStorage,
    orchestrator: Arc<Orchestrator>,
}

impl CivitdlCore {
    /// Open the data directory using the saved configuration
    pub async fn new(data_dir: PathBuf) -> Result<Self, CivitdlError> {
        let storage = ConfigStorage::new(data_dir).await?;
        let config = storage.load_config().await?;
        Self::open(storage, config).await
    }

    /// Open the data directory with an explicit configuration
    pub async fn with_config(data_dir: PathBuf, config: Config) -> Result<Self, CivitdlError> {
        let storage = ConfigStorage::new(data_dir).await?;
        Self::open(storage, config).await
    }

    async fn open(storage: ConfigStorage, config: Config) -> Result<Self, CivitdlError> {
        config.validate().map_err(CivitdlError::InvalidConfig)?;

        let store = StateStore::open(storage.state_db_path(), config.max_attempts).await?;
        let api: Arc<dyn ApiClient> = Arc::new(CivitaiClient::new(
            &config.api_base_url,
            config.api_key.clone(),
            &config.user_agent,
        )?);
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.user_agent)?);
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            api,
            transport,
            RunOptions::from_config(&config),
        ));

        Ok(Self {
            config,
            storage,
            orchestrator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        self.storage.data_dir()
    }

    pub fn store(&self) -> &StateStore {
        self.orchestrator.store()
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.orchestrator.subscribe()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.orchestrator.progress()
    }

    /// Stop the current run, parking unfinished work
    pub fn cancel(&self) {
        self.orchestrator.cancel();
    }


    // ========================================================================
    // Download Operations
    // ========================================================================

    /// Download a selection into `destination` (or the configured root)
    pub async fn download(
        &self,
        selection: &Selection,
        concurrency: Option<usize>,
        destination: Option<&Path>,
    ) -> Result<RunSummary, CivitdlError> {
        let concurrency = concurrency.unwrap_or(self.config.concurrency as usize);
        let destination = destination.unwrap_or(&self.config.download_root);
        self.orchestrator.run(selection, concurrency, destination).await
    }

    // ========================================================================
    // State Queries
    // ========================================================================

    pub async fn status_counts(&self) -> Result<StatusCounts, CivitdlError> {
        self.store().counts().await
    }

    pub async fn list_assets(
        &self,
        status: Option<AssetStatus>,
    ) -> Result<Vec<AssetVersion>, CivitdlError> {
        self.store().list(status).await
    }

    /// Give permanently failed assets a fresh attempt budget
    pub async fn retry_failed(&self) -> Result<u64, CivitdlError> {
        self.store().requeue_failed().await
    }

    pub async fn close(&self) {
        self.store().close().await;
    }
}
