use std::collections::BTreeMap;

use async_trait::async_trait;
use calp_core::{Listing, UpsertOutcome};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    document_for_write, fingerprint, ListingPage, ListingQuery, ListingStore, StoreError,
    StoredListing,
};

#[derive(Debug, Clone)]
struct Row {
    listing: Listing,
    fingerprint: String,
    created_seq: u64,
}

#[derive(Debug, Default)]
struct State {
    rows: BTreeMap<String, Row>,
    next_seq: u64,
}

/// In-process store with the same upsert and sync-state semantics as
/// [`crate::PgListingStore`]. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    state: Mutex<State>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get_by_url(&self, url: &str) -> Option<Listing> {
        self.state.lock().await.rows.get(url).map(|row| row.listing.clone())
    }
}

fn contains_ci(haystack: Option<&str>, needle: &str) -> bool {
    haystack
        .map(|h| h.to_lowercase().contains(&needle.to_lowercase()))
        .unwrap_or(false)
}

fn matches(listing: &Listing, query: &ListingQuery) -> bool {
    if let Some(make) = &query.make {
        if !contains_ci(listing.make.as_deref(), make) {
            return false;
        }
    }
    if let Some(model) = &query.model {
        if !contains_ci(listing.model.as_deref(), model) {
            return false;
        }
    }
    let price = listing.price.amount();
    if let Some(min) = query.min_price {
        if !price.is_some_and(|p| p >= min) {
            return false;
        }
    }
    if let Some(max) = query.max_price {
        if !price.is_some_and(|p| p <= max) {
            return false;
        }
    }
    true
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert(&self, listing: &Listing) -> Result<UpsertOutcome, StoreError> {
        let fingerprint = fingerprint(listing)?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let id_taken = state
            .rows
            .iter()
            .any(|(url, row)| url != &listing.url && row.listing.id == listing.id);
        if id_taken {
            return Err(StoreError::DuplicateId {
                id: listing.id.clone(),
                url: listing.url.clone(),
            });
        }

        let seq = state.next_seq;
        match state.rows.get_mut(&listing.url) {
            Some(row) if row.fingerprint == fingerprint => Ok(UpsertOutcome::Unchanged),
            Some(row) => {
                row.listing = document_for_write(listing);
                row.fingerprint = fingerprint;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                state.rows.insert(
                    listing.url.clone(),
                    Row {
                        listing: document_for_write(listing),
                        fingerprint,
                        created_seq: seq,
                    },
                );
                state.next_seq += 1;
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn find_unindexed(&self) -> Result<Vec<StoredListing>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<&Row> = state.rows.values().filter(|row| !row.listing.indexed).collect();
        rows.sort_by_key(|row| row.created_seq);
        Ok(rows
            .into_iter()
            .map(|row| StoredListing {
                listing: row.listing.clone(),
                fingerprint: row.fingerprint.clone(),
            })
            .collect())
    }

    async fn mark_indexed(
        &self,
        url: &str,
        fingerprint: &str,
        indexed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(url) {
            Some(row) if row.fingerprint == fingerprint => {
                row.listing.indexed = true;
                row.listing.last_indexed = Some(indexed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_image_downloaded(&self, url: &str, image_url: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.rows.get_mut(url) else {
            return Ok(false);
        };
        let mut marked = false;
        for image in row.listing.images.iter_mut().filter(|i| i.url == image_url) {
            image.downloaded = true;
            marked = true;
        }
        Ok(marked)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .find(|row| row.listing.id == id)
            .map(|row| row.listing.clone()))
    }

    async fn query(&self, query: &ListingQuery) -> Result<ListingPage, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<&Row> = state
            .rows
            .values()
            .filter(|row| matches(&row.listing, query))
            .collect();
        rows.sort_by(|a, b| b.created_seq.cmp(&a.created_seq));
        let total = rows.len();
        let listings = rows
            .into_iter()
            .skip(query.offset())
            .take(query.limit())
            .map(|row| row.listing.clone())
            .collect();
        Ok(ListingPage::new(query, total, listings))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.len().await)
    }
}
