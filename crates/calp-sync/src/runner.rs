use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use calp_core::{ExtractionOutcome, SyncOutcome};
use calp_storage::{
    ImageDownloader, ImageFetchConfig, ImageFetcher, ImageStore, ListingStore, PgListingStore,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::extraction::{
    ChromeLauncher, ExtractionPipeline, ExtractionSettings, SearchFilter, SessionLauncher,
};
use crate::replication::{SyncCoordinator, SyncSettings};
use crate::search::{ElasticsearchIndex, SearchIndex};

const SEARCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Owns both pipelines and serializes their runs: at most one extraction or
/// sync executes at a time, whichever of the CLI, scheduler or HTTP API
/// asked for it.
pub struct PipelineRunner {
    store: Arc<dyn ListingStore>,
    launcher: Arc<dyn SessionLauncher>,
    extraction: ExtractionPipeline,
    extraction_settings: ExtractionSettings,
    sync: SyncCoordinator,
    run_lock: Mutex<()>,
}

impl PipelineRunner {
    pub fn new(
        store: Arc<dyn ListingStore>,
        index: Arc<dyn SearchIndex>,
        launcher: Arc<dyn SessionLauncher>,
        extraction: ExtractionSettings,
        sync: SyncSettings,
    ) -> Self {
        Self {
            extraction: ExtractionPipeline::new(store.clone(), extraction.clone()),
            extraction_settings: extraction,
            sync: SyncCoordinator::new(store.clone(), index, sync),
            store,
            launcher,
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_images(mut self, downloader: Arc<ImageDownloader>) -> Self {
        self.extraction = self.extraction.with_images(downloader);
        self
    }

    /// Connect the store (creating its schema), then wire the search index,
    /// browser launcher and optional image downloader from `config`.
    pub async fn connect(config: &PipelineConfig) -> Result<Self> {
        let store = PgListingStore::connect(&config.database_url, &config.listings_table)
            .await
            .context("connecting listing store")?;
        store.ensure_indexes().await.context("creating listing store schema")?;
        info!(table = store.table(), "listing store ready");

        let index = ElasticsearchIndex::new(&config.elasticsearch, SEARCH_REQUEST_TIMEOUT)
            .context("building search index client")?;
        let runner = Self::new(
            Arc::new(store),
            Arc::new(index),
            Arc::new(ChromeLauncher::new(config.session_config())),
            ExtractionSettings::from_config(config),
            SyncSettings::from_config(config),
        );

        if !config.download_images {
            return Ok(runner);
        }
        let fetcher = ImageFetcher::new(ImageFetchConfig {
            timeout: config.http_timeout,
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        let downloader = ImageDownloader::new(fetcher, ImageStore::new(config.images_dir.clone()));
        info!(dir = %config.images_dir.display(), "image downloads enabled");
        Ok(runner.with_images(Arc::new(downloader)))
    }

    pub fn store(&self) -> Arc<dyn ListingStore> {
        self.store.clone()
    }

    /// Waits for any run in progress, then extracts.
    pub async fn run_extraction(&self) -> ExtractionOutcome {
        let _guard = self.run_lock.lock().await;
        self.extraction.launch_and_run(self.launcher.as_ref()).await
    }

    /// Extracts unless another run is in progress.
    pub async fn try_run_extraction(&self) -> Option<ExtractionOutcome> {
        self.try_run_filtered_extraction(&SearchFilter::default()).await
    }

    /// Extracts from the configured search narrowed by `filter`, unless
    /// another run is in progress.
    pub async fn try_run_filtered_extraction(&self, filter: &SearchFilter) -> Option<ExtractionOutcome> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("extraction requested while another run is in progress");
            return None;
        };
        let search_url = match self.extraction_settings.search_url_for(filter) {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "search url could not be narrowed");
                return Some(ExtractionOutcome::failed(format!("invalid search url: {err}")));
            }
        };
        Some(
            self.extraction
                .launch_and_run_at(self.launcher.as_ref(), &search_url)
                .await,
        )
    }

    pub async fn run_sync(&self) -> SyncOutcome {
        let _guard = self.run_lock.lock().await;
        self.sync.run().await
    }

    pub async fn try_run_sync(&self) -> Option<SyncOutcome> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("sync requested while another run is in progress");
            return None;
        };
        Some(self.sync.run().await)
    }
}
