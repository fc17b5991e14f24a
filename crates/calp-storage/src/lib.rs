//! Listing document store contract, its Postgres and in-memory
//! implementations, and the image download side-channel.

use async_trait::async_trait;
use calp_core::{Listing, UpsertOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod images;
pub mod memory;
pub mod pg;

pub use images::{
    FetchError, ImageDownloadReport, ImageDownloader, ImageFetchConfig, ImageFetcher, ImageRetry,
    ImageStore, StoredImage,
};
pub use memory::MemoryListingStore;
pub use pg::PgListingStore;

pub const CRATE_NAME: &str = "calp-storage";

/// Fields that change on every pass or belong to the sync/download state
/// machines. They never make a listing "changed".
const VOLATILE_FIELDS: &[&str] = &["scrape_date", "scrape_timestamp", "indexed", "last_indexed"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("listing id {id} is already stored under another url (new url {url})")]
    DuplicateId { id: String, url: String },
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
}

/// A listing as read back from the store, together with the fingerprint of
/// the content that was read.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredListing {
    pub listing: Listing,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingQuery {
    pub make: Option<String>,
    pub model: Option<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub page: usize,
    pub limit: usize,
}

impl Default for ListingQuery {
    fn default() -> Self {
        Self {
            make: None,
            model: None,
            min_price: None,
            max_price: None,
            page: 1,
            limit: 20,
        }
    }
}

impl ListingQuery {
    pub fn page(&self) -> usize {
        self.page.max(1)
    }

    pub fn limit(&self) -> usize {
        self.limit.clamp(1, 100)
    }

    pub fn offset(&self) -> usize {
        (self.page() - 1) * self.limit()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingPage {
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub total_pages: usize,
    pub listings: Vec<Listing>,
}

impl ListingPage {
    pub fn new(query: &ListingQuery, total: usize, listings: Vec<Listing>) -> Self {
        let limit = query.limit();
        Self {
            total,
            page: query.page(),
            limit,
            total_pages: total.div_ceil(limit),
            listings,
        }
    }
}

/// Durable listing store keyed by source URL.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Create the backing collection and its secondary indexes. Idempotent.
    async fn ensure_indexes(&self) -> Result<(), StoreError>;

    /// Insert or fully overwrite the listing stored under `listing.url`.
    /// A content change resets the listing to unindexed.
    async fn upsert(&self, listing: &Listing) -> Result<UpsertOutcome, StoreError>;

    /// Listings not yet replicated to the search index, oldest first.
    async fn find_unindexed(&self) -> Result<Vec<StoredListing>, StoreError>;

    /// Flag a listing as replicated. Returns false when the stored content no
    /// longer matches `fingerprint` (it changed after it was read) or the
    /// url is unknown.
    async fn mark_indexed(
        &self,
        url: &str,
        fingerprint: &str,
        indexed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn mark_image_downloaded(&self, url: &str, image_url: &str) -> Result<bool, StoreError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Listing>, StoreError>;

    async fn query(&self, query: &ListingQuery) -> Result<ListingPage, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

/// SHA-256 over the canonical JSON of the listing content.
pub fn fingerprint(listing: &Listing) -> Result<String, StoreError> {
    let mut value = serde_json::to_value(listing)?;
    if let Some(map) = value.as_object_mut() {
        for key in VOLATILE_FIELDS {
            map.remove(*key);
        }
        if let Some(images) = map.get_mut("images").and_then(|v| v.as_array_mut()) {
            for image in images {
                if let Some(image) = image.as_object_mut() {
                    image.remove("downloaded");
                }
            }
        }
    }
    let bytes = serde_json::to_vec(&value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// The document as written: sync state always starts over.
pub(crate) fn document_for_write(listing: &Listing) -> Listing {
    let mut doc = listing.clone();
    doc.indexed = false;
    doc.last_indexed = None;
    doc
}
