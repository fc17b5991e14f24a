//! Search index seam. [`ElasticsearchIndex`] talks to the Elasticsearch REST
//! API; [`MemorySearchIndex`] keeps documents in memory for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ElasticsearchSettings;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search index request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("search index returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("search index payload error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("search index unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCreation {
    Created,
    AlreadyExists,
}

/// One document to (re)index under a stable id.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkAction {
    pub id: String,
    pub source: Value,
}

/// Per-document result of a bulk write. Ids absent from `succeeded` were not
/// confirmed and must not be treated as indexed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub succeeded: BTreeSet<String>,
    pub failed: Vec<(String, String)>,
}

impl BulkReport {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_confirmed(&self, id: &str) -> bool {
        self.succeeded.contains(id)
    }
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_exists(&self, name: &str) -> Result<bool, IndexError>;

    async fn create_index_if_absent(&self, name: &str, mapping: &Value) -> Result<IndexCreation, IndexError>;

    async fn bulk_write(&self, index: &str, actions: &[BulkAction]) -> Result<BulkReport, IndexError>;
}

pub struct ElasticsearchIndex {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, Option<String>)>,
}

impl ElasticsearchIndex {
    pub fn new(settings: &ElasticsearchSettings, timeout: std::time::Duration) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: settings.base_url(),
            credentials: settings
                .user
                .clone()
                .map(|user| (user, settings.password.clone())),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}/{path}", self.base_url));
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, password.as_ref()),
            None => builder,
        }
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn index_exists(&self, name: &str) -> Result<bool, IndexError> {
        let resp = self.request(reqwest::Method::HEAD, name).send().await?;
        match resp.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(IndexError::Api {
                status: status.as_u16(),
                message: format!("unexpected status checking index {name}"),
            }),
        }
    }

    async fn create_index_if_absent(&self, name: &str, mapping: &Value) -> Result<IndexCreation, IndexError> {
        if self.index_exists(name).await? {
            info!(index = name, "search index already exists");
            return Ok(IndexCreation::AlreadyExists);
        }

        let resp = self.request(reqwest::Method::PUT, name).json(mapping).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // lost a creation race with another process
            if body.contains("resource_already_exists_exception") {
                return Ok(IndexCreation::AlreadyExists);
            }
            return Err(IndexError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        info!(index = name, "search index created");
        Ok(IndexCreation::Created)
    }

    async fn bulk_write(&self, index: &str, actions: &[BulkAction]) -> Result<BulkReport, IndexError> {
        if actions.is_empty() {
            return Ok(BulkReport::default());
        }
        let body = bulk_body(index, actions)?;
        let resp = self
            .request(reqwest::Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IndexError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        let response: BulkResponse = resp.json().await?;
        let report = bulk_report(actions, response);
        debug!(
            index,
            succeeded = report.success_count(),
            failed = report.failure_count(),
            "bulk write finished"
        );
        Ok(report)
    }
}

/// NDJSON body for `POST /_bulk`: an `index` action line then the source
/// line per document, newline terminated.
pub fn bulk_body(index: &str, actions: &[BulkAction]) -> Result<String, IndexError> {
    let mut body = String::new();
    for action in actions {
        let header = serde_json::json!({ "index": { "_index": index, "_id": action.id } });
        body.push_str(&serde_json::to_string(&header)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&action.source)?);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
pub struct BulkItem {
    #[serde(rename = "_id")]
    pub id: Option<String>,
    pub status: u16,
    pub error: Option<Value>,
}

/// Split the bulk response into confirmed and failed ids. Requested ids the
/// response does not mention count as failed.
pub fn bulk_report(actions: &[BulkAction], response: BulkResponse) -> BulkReport {
    let mut report = BulkReport::default();
    let mut seen = BTreeSet::new();

    for item in response.items.into_iter().flat_map(|entry| entry.into_values()) {
        let Some(id) = item.id else { continue };
        seen.insert(id.clone());
        match item.error {
            None if (200..300).contains(&item.status) => {
                report.succeeded.insert(id);
            }
            error => {
                let reason = error
                    .as_ref()
                    .and_then(|e| e.get("reason").and_then(Value::as_str).or_else(|| e.as_str()))
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("status {}", item.status));
                report.failed.push((id, reason));
            }
        }
    }

    for action in actions {
        if !seen.contains(&action.id) {
            report.failed.push((action.id.clone(), "not confirmed by bulk response".to_string()));
        }
    }
    if response.errors && report.failed.is_empty() {
        debug!("bulk response flagged errors but every item succeeded");
    }
    report
}

#[derive(Debug, Default)]
struct MemoryIndexState {
    indices: HashMap<String, Value>,
    documents: HashMap<String, BTreeMap<String, Value>>,
    bulk_calls: usize,
    writes: usize,
}

/// In-memory index. Ids registered with [`MemorySearchIndex::fail_ids`] are
/// rejected per item; [`MemorySearchIndex::set_unavailable`] fails whole
/// requests the way a dropped connection would.
#[derive(Debug, Default)]
pub struct MemorySearchIndex {
    state: Mutex<MemoryIndexState>,
    failing: Mutex<BTreeSet<String>>,
    unavailable: Mutex<bool>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing.lock().await.extend(ids.into_iter().map(Into::into));
    }

    pub async fn clear_failures(&self) {
        self.failing.lock().await.clear();
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().await = unavailable;
    }

    pub async fn document(&self, index: &str, id: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state.documents.get(index).and_then(|docs| docs.get(id)).cloned()
    }

    pub async fn document_count(&self, index: &str) -> usize {
        let state = self.state.lock().await;
        state.documents.get(index).map_or(0, BTreeMap::len)
    }

    /// Documents written across all bulk calls, including overwrites.
    pub async fn writes(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn bulk_calls(&self) -> usize {
        self.state.lock().await.bulk_calls
    }

    pub async fn has_index(&self, name: &str) -> bool {
        self.state.lock().await.indices.contains_key(name)
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn index_exists(&self, name: &str) -> Result<bool, IndexError> {
        if *self.unavailable.lock().await {
            return Err(IndexError::Unavailable("memory index offline".to_string()));
        }
        Ok(self.state.lock().await.indices.contains_key(name))
    }

    async fn create_index_if_absent(&self, name: &str, mapping: &Value) -> Result<IndexCreation, IndexError> {
        if *self.unavailable.lock().await {
            return Err(IndexError::Unavailable("memory index offline".to_string()));
        }
        let mut state = self.state.lock().await;
        if state.indices.contains_key(name) {
            return Ok(IndexCreation::AlreadyExists);
        }
        state.indices.insert(name.to_string(), mapping.clone());
        Ok(IndexCreation::Created)
    }

    async fn bulk_write(&self, index: &str, actions: &[BulkAction]) -> Result<BulkReport, IndexError> {
        if *self.unavailable.lock().await {
            return Err(IndexError::Unavailable("memory index offline".to_string()));
        }
        let failing = self.failing.lock().await.clone();
        let mut state = self.state.lock().await;
        state.bulk_calls += 1;

        let mut report = BulkReport::default();
        for action in actions {
            if failing.contains(&action.id) {
                report
                    .failed
                    .push((action.id.clone(), "mapper_parsing_exception".to_string()));
                continue;
            }
            state
                .documents
                .entry(index.to_string())
                .or_default()
                .insert(action.id.clone(), action.source.clone());
            state.writes += 1;
            report.succeeded.insert(action.id.clone());
        }
        Ok(report)
    }
}
