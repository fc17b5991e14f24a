//! Store → search index replication driven by the `indexed` flag.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use calp_core::{SyncCounts, SyncOutcome};
use calp_storage::{ListingStore, StoredListing};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::search::{BulkAction, SearchIndex};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub index_name: String,
    pub mapping_file: PathBuf,
    pub batch_size: usize,
}

impl SyncSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            index_name: config.elasticsearch.index.clone(),
            mapping_file: config.elasticsearch.mapping_file.clone(),
            batch_size: config.sync_batch_size,
        }
    }
}

pub struct SyncCoordinator {
    store: Arc<dyn ListingStore>,
    index: Arc<dyn SearchIndex>,
    settings: SyncSettings,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn ListingStore>, index: Arc<dyn SearchIndex>, settings: SyncSettings) -> Self {
        Self { store, index, settings }
    }

    /// Replicate every unindexed listing. Always returns an outcome; setup
    /// faults (mapping, index creation, store read) yield `success=false`.
    pub async fn run(&self) -> SyncOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, index = %self.settings.index_name);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> SyncOutcome {
        let started = Instant::now();
        let mut counts = SyncCounts::default();

        let pending = match self.prepare().await {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = %format!("{err:#}"), "sync aborted");
                return outcome(run_id, started, false, format!("{err:#}"), counts);
            }
        };
        counts.pending = pending.len();
        info!(pending = counts.pending, "listings awaiting replication");

        for batch in pending.chunks(self.settings.batch_size.max(1)) {
            self.sync_batch(batch, &mut counts).await;
        }

        let message = format!(
            "indexed {} of {} pending listings ({} failed, {} marked)",
            counts.indexed, counts.pending, counts.failed, counts.marked
        );
        info!(
            pending = counts.pending,
            indexed = counts.indexed,
            failed = counts.failed,
            marked = counts.marked,
            mark_errors = counts.mark_errors,
            "sync finished"
        );
        outcome(run_id, started, true, message, counts)
    }

    async fn prepare(&self) -> anyhow::Result<Vec<StoredListing>> {
        let name = &self.settings.index_name;
        let exists = self
            .index
            .index_exists(name)
            .await
            .with_context(|| format!("checking search index {name}"))?;
        if exists {
            debug!("search index already exists");
        } else {
            let mapping = load_mapping(&self.settings.mapping_file).await?;
            let creation = self
                .index
                .create_index_if_absent(name, &mapping)
                .await
                .with_context(|| format!("creating search index {name}"))?;
            info!(?creation, "search index ready");
        }

        self.store
            .find_unindexed()
            .await
            .context("loading unindexed listings")
    }

    async fn sync_batch(&self, batch: &[StoredListing], counts: &mut SyncCounts) {
        let indexed_at = Utc::now();
        let mut actions = Vec::with_capacity(batch.len());
        for stored in batch {
            match index_action(stored, indexed_at) {
                Ok(action) => actions.push(action),
                Err(err) => {
                    warn!(url = %stored.listing.url, error = %err, "listing could not be serialized for indexing");
                    counts.failed += 1;
                }
            }
        }

        let report = match self.index.bulk_write(&self.settings.index_name, &actions).await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, documents = actions.len(), "bulk write failed; batch left unindexed");
                counts.failed += actions.len();
                return;
            }
        };
        counts.indexed += report.success_count();
        counts.failed += report.failure_count();
        for (id, reason) in &report.failed {
            warn!(%id, %reason, "document rejected by search index");
        }

        for stored in batch {
            if !report.is_confirmed(stored.listing.document_id()) {
                continue;
            }
            match self
                .store
                .mark_indexed(&stored.listing.url, &stored.fingerprint, indexed_at)
                .await
            {
                Ok(true) => counts.marked += 1,
                Ok(false) => {
                    debug!(url = %stored.listing.url, "listing changed since it was read; left for next sync")
                }
                Err(err) => {
                    warn!(url = %stored.listing.url, error = %err, "failed to mark listing indexed");
                    counts.mark_errors += 1;
                }
            }
        }
    }
}

/// The indexed document: the listing as stored, stamped with its sync
/// state. The store fingerprint is not part of it.
pub fn index_action(stored: &StoredListing, indexed_at: DateTime<Utc>) -> Result<BulkAction, serde_json::Error> {
    let mut doc = stored.listing.clone();
    doc.indexed = true;
    doc.last_indexed = Some(indexed_at);
    Ok(BulkAction {
        id: doc.document_id().to_string(),
        source: serde_json::to_value(&doc)?,
    })
}

/// Read only when the index has to be created.
async fn load_mapping(path: &Path) -> anyhow::Result<Value> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading index mapping {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing index mapping {}", path.display()))
}

fn outcome(run_id: Uuid, started: Instant, success: bool, message: String, counts: SyncCounts) -> SyncOutcome {
    SyncOutcome {
        run_id,
        success,
        message,
        counts,
        duration_seconds: started.elapsed().as_secs_f64(),
        timestamp: Utc::now(),
    }
}
