//! JSON API over the listing store plus run triggers for both pipelines.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use calp_storage::{ListingQuery, ListingStore, StoreError};
use calp_sync::{PipelineConfig, PipelineRunner, SearchFilter};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "calp-web";

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<PipelineRunner>,
}

impl AppState {
    pub fn new(runner: Arc<PipelineRunner>) -> Self {
        Self { runner }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListingsParams {
    make: Option<String>,
    model: Option<String>,
    #[serde(alias = "minPrice")]
    min_price: Option<i64>,
    #[serde(alias = "maxPrice")]
    max_price: Option<i64>,
    page: Option<usize>,
    limit: Option<usize>,
}

impl From<ListingsParams> for ListingQuery {
    fn from(params: ListingsParams) -> Self {
        let defaults = ListingQuery::default();
        ListingQuery {
            make: params.make.filter(|s| !s.trim().is_empty()),
            model: params.model.filter(|s| !s.trim().is_empty()),
            min_price: params.min_price,
            max_price: params.max_price,
            page: params.page.unwrap_or(defaults.page),
            limit: params.limit.unwrap_or(defaults.limit),
        }
    }
}

/// Optional JSON body of `POST /api/scrape`.
#[derive(Debug, Default, Deserialize)]
struct ScrapeParams {
    make: Option<String>,
    #[serde(alias = "minPrice")]
    min_price: Option<i64>,
}

impl ScrapeParams {
    fn from_body(body: &[u8]) -> Result<Self, String> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let params: Self = serde_json::from_slice(body).map_err(|e| format!("Invalid request body: {e}"))?;
        if params.make.as_deref().is_some_and(|make| make.trim().is_empty()) {
            return Err("Make is required".to_string());
        }
        if params.min_price.is_some_and(|price| price < 0) {
            return Err("minPrice must not be negative".to_string());
        }
        Ok(params)
    }
}

impl From<ScrapeParams> for SearchFilter {
    fn from(params: ScrapeParams) -> Self {
        SearchFilter {
            make: params.make,
            min_price: params.min_price,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/api/listings", get(listings_handler))
        .route("/api/listings/{id}", get(listing_detail_handler))
        .route("/api/scrape", post(scrape_handler))
        .route("/api/sync", post(sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &PipelineConfig, runner: Arc<PipelineRunner>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "http api listening");
    axum::serve(listener, app(AppState::new(runner)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.store().count().await {
        Ok(listings) => Json(json!({ "message": "Car ad listing API is running", "listings": listings })).into_response(),
        Err(err) => store_error(err),
    }
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListingsParams>,
) -> Response {
    let query = ListingQuery::from(params);
    match state.runner.store().query(&query).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => store_error(err),
    }
}

async fn listing_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.runner.store().get_by_id(&id).await {
        Ok(Some(listing)) => Json(listing).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Car listing not found" })),
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

async fn scrape_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let filter = match ScrapeParams::from_body(&body) {
        Ok(params) => SearchFilter::from(params),
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response();
        }
    };
    match state.runner.try_run_filtered_extraction(&filter).await {
        Some(outcome) => Json(outcome).into_response(),
        None => busy(),
    }
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.try_run_sync().await {
        Some(outcome) => Json(outcome).into_response(),
        None => busy(),
    }
}

fn busy() -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": "A pipeline run is already in progress" })),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "listing store request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Server error" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use calp_adapters::{BrowserSession, SessionError, StaticSession};
    use calp_core::{Listing, Price};
    use calp_storage::MemoryListingStore;
    use calp_sync::{ExtractionSettings, MemorySearchIndex, SessionLauncher, SyncSettings};
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    const SEARCH: &str = "https://www.blocket.se/annonser/hela_sverige/fordon/bilar?q=porsche";

    struct RecordedLauncher(StaticSession);

    #[async_trait]
    impl SessionLauncher for RecordedLauncher {
        async fn launch(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
            Ok(Box::new(self.0.clone()))
        }
    }

    fn listing(id: &str, make: &str, price: i64) -> Listing {
        let scraped_at = Utc.with_ymd_and_hms(2026, 3, 1, 5, 0, 0).single().unwrap();
        let mut listing = Listing::new(format!("https://www.blocket.se/annons/{id}"), scraped_at);
        listing.title = format!("{make} #{id}");
        listing.make = Some(make.to_string());
        listing.price = Price::new(Some(price));
        listing
    }

    async fn test_app(mapping: &std::path::Path) -> Router {
        let store = Arc::new(MemoryListingStore::new());
        store.upsert(&listing("111", "Porsche", 1_195_000)).await.unwrap();
        store.upsert(&listing("222", "Porsche", 640_000)).await.unwrap();
        store.upsert(&listing("333", "Volvo", 89_000)).await.unwrap();

        let session = StaticSession::new().with_page(SEARCH, "<html><body>no results</body></html>");
        let runner = PipelineRunner::new(
            store,
            Arc::new(MemorySearchIndex::new()),
            Arc::new(RecordedLauncher(session)),
            ExtractionSettings {
                search_url: SEARCH.to_string(),
                listing_marker: "/annons/".to_string(),
                max_scrolls: 0,
            },
            SyncSettings {
                index_name: "car_ads".to_string(),
                mapping_file: mapping.to_path_buf(),
                batch_size: 500,
            },
        );
        app(AppState::new(Arc::new(runner)))
    }

    fn mapping() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{}").unwrap();
        file
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        send_body(app, method, uri, "").await
    }

    async fn send_body(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_reports_listing_count() {
        let mapping = mapping();
        let (status, body) = send(test_app(mapping.path()).await, "GET", "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["listings"], 3);
    }

    #[tokio::test]
    async fn listings_filter_and_paginate() {
        let mapping = mapping();
        let app = test_app(mapping.path()).await;

        let (status, body) = send(app.clone(), "GET", "/api/listings?make=porsche&minPrice=700000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["listings"][0]["id"], "111");

        let (_, body) = send(app, "GET", "/api/listings?page=2&limit=2").await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["total_pages"], 2);
        assert_eq!(body["page"], 2);
        assert_eq!(body["listings"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn listing_detail_and_not_found() {
        let mapping = mapping();
        let app = test_app(mapping.path()).await;

        let (status, body) = send(app.clone(), "GET", "/api/listings/222").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["price"], 640_000);
        assert_eq!(body["price_range"], "500,000 - 1,000,000 kr");

        let (status, body) = send(app, "GET", "/api/listings/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Car listing not found");
    }

    #[tokio::test]
    async fn run_triggers_return_outcomes() {
        let mapping = mapping();
        let app = test_app(mapping.path()).await;

        let (status, body) = send(app.clone(), "POST", "/api/scrape").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["counts"]["discovered"], 0);

        let (status, body) = send(app.clone(), "POST", "/api/sync").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["counts"]["marked"], 3);

        let (_, body) = send(app, "POST", "/api/sync").await;
        assert_eq!(body["counts"]["pending"], 0);
    }

    #[tokio::test]
    async fn scrape_accepts_make_and_minimum_price() {
        let mapping = mapping();
        let app = test_app(mapping.path()).await;

        // the recorded session only knows the unfiltered search page
        let (status, body) = send_body(app.clone(), "POST", "/api/scrape", r#"{"make":"Volvo","minPrice":150000}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("q=volvo&mys=150000"));

        let (status, body) = send_body(app.clone(), "POST", "/api/scrape", r#"{"make":"  "}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Make is required");

        let (status, _) = send_body(app, "POST", "/api/scrape", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
