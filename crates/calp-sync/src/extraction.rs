//! One extraction run: results page → listing URLs → rendered detail pages →
//! normalized listings → store upserts.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use calp_adapters::{
    discover_listing_urls, parse_listing_page, BrowserSession, ChromeSession, SessionConfig,
    SessionError, CONSENT_SELECTORS,
};
use calp_core::{ExtractionCounts, ExtractionOutcome};
use calp_storage::{ImageDownloadReport, ImageDownloader, ListingStore};
use chrono::Utc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::config::PipelineConfig;

/// Element that marks a detail page as rendered.
const DETAIL_READY_SELECTOR: &str = "body";

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub search_url: String,
    pub listing_marker: String,
    pub max_scrolls: usize,
}

impl ExtractionSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            search_url: config.search_url.clone(),
            listing_marker: config.listing_marker.clone(),
            max_scrolls: config.max_scrolls,
        }
    }

    /// The configured search URL narrowed by `filter`: the make replaces the
    /// `q` query parameter and the minimum price replaces `mys`.
    pub fn search_url_for(&self, filter: &SearchFilter) -> Result<String, url::ParseError> {
        if filter.is_empty() {
            return Ok(self.search_url.clone());
        }
        let mut url = Url::parse(&self.search_url)?;
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| {
                !((key == "q" && filter.make.is_some()) || (key == "mys" && filter.min_price.is_some()))
            })
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (key, value) in &kept {
                query.append_pair(key, value);
            }
            if let Some(make) = &filter.make {
                query.append_pair("q", &make.trim().to_lowercase());
            }
            if let Some(min_price) = filter.min_price {
                query.append_pair("mys", &min_price.to_string());
            }
        }
        Ok(url.to_string())
    }
}

/// Optional narrowing of one extraction run's search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub make: Option<String>,
    pub min_price: Option<i64>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.make.is_none() && self.min_price.is_none()
    }
}

/// Opens a fresh browser session per run.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, SessionError>;
}

pub struct ChromeLauncher {
    config: SessionConfig,
}

impl ChromeLauncher {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let session = ChromeSession::launch(self.config.clone()).await?;
        Ok(Box::new(session))
    }
}

pub struct ExtractionPipeline {
    store: Arc<dyn ListingStore>,
    images: Option<Arc<ImageDownloader>>,
    settings: ExtractionSettings,
}

impl ExtractionPipeline {
    pub fn new(store: Arc<dyn ListingStore>, settings: ExtractionSettings) -> Self {
        Self {
            store,
            images: None,
            settings,
        }
    }

    pub fn with_images(mut self, downloader: Arc<ImageDownloader>) -> Self {
        self.images = Some(downloader);
        self
    }

    /// Launch a session and run. A launch failure is a failed outcome.
    pub async fn launch_and_run(&self, launcher: &dyn SessionLauncher) -> ExtractionOutcome {
        self.launch_and_run_at(launcher, &self.settings.search_url).await
    }

    pub async fn launch_and_run_at(&self, launcher: &dyn SessionLauncher, search_url: &str) -> ExtractionOutcome {
        let started = Instant::now();
        match launcher.launch().await {
            Ok(mut session) => self.run_at(session.as_mut(), search_url).await,
            Err(err) => {
                error!(error = %err, "browser session could not be started");
                outcome(
                    Uuid::new_v4(),
                    started,
                    false,
                    format!("browser launch failed: {err}"),
                    ExtractionCounts::default(),
                )
            }
        }
    }

    /// Run against an open session, which is closed before returning.
    pub async fn run(&self, session: &mut dyn BrowserSession) -> ExtractionOutcome {
        self.run_at(session, &self.settings.search_url).await
    }

    pub async fn run_at(&self, session: &mut dyn BrowserSession, search_url: &str) -> ExtractionOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("extraction_run", %run_id, %search_url);
        async {
            let started = Instant::now();
            let mut counts = ExtractionCounts::default();
            let result = self.run_inner(session, search_url, &mut counts).await;
            if let Err(err) = session.close().await {
                warn!(error = %err, "closing browser session failed");
            }

            match result {
                Ok(()) => {
                    info!(
                        discovered = counts.discovered,
                        total = counts.total,
                        inserted = counts.inserted,
                        updated = counts.updated,
                        unchanged = counts.unchanged,
                        skipped = counts.skipped,
                        errors = counts.errors,
                        "extraction finished"
                    );
                    let message = format!(
                        "processed {} of {} discovered listings ({} new, {} updated, {} unchanged)",
                        counts.total, counts.discovered, counts.inserted, counts.updated, counts.unchanged
                    );
                    outcome(run_id, started, true, message, counts)
                }
                Err(err) => {
                    error!(error = %err, "extraction aborted");
                    outcome(run_id, started, false, err.to_string(), counts)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_inner(
        &self,
        session: &mut dyn BrowserSession,
        search_url: &str,
        counts: &mut ExtractionCounts,
    ) -> Result<(), SessionError> {
        session.navigate(search_url).await?;

        match session.dismiss_consent(CONSENT_SELECTORS).await {
            Ok(Some(selector)) => debug!(%selector, "consent handled"),
            Ok(None) => debug!("no consent dialog found"),
            Err(err) => warn!(error = %err, "consent handling failed"),
        }
        match session.scroll_to_stable(self.settings.max_scrolls).await {
            Ok(grew) => debug!(grew, "results page scrolled"),
            Err(err) => warn!(error = %err, "scrolling results page failed"),
        }

        let results_html = session.rendered_html().await?;
        let urls = discover_listing_urls(session, &results_html, &self.settings.listing_marker).await;
        counts.discovered = urls.len();
        info!(discovered = counts.discovered, "listing urls discovered");

        let mut images = ImageDownloadReport::default();
        for url in &urls {
            let html = match self.render_listing(session, url).await {
                Ok(html) => html,
                Err(err) => {
                    warn!(url = %url, error = %err, "listing skipped");
                    counts.skipped += 1;
                    return_to_results(session, search_url).await;
                    continue;
                }
            };

            let listing = parse_listing_page(url, &html, Utc::now());
            counts.total += 1;
            match self.store.upsert(&listing).await {
                Ok(outcome) => {
                    debug!(url = %url, ?outcome, "listing stored");
                    counts.record(outcome);
                    if let Some(downloader) = &self.images {
                        let report = downloader.download_listing_images(self.store.as_ref(), &listing).await;
                        images.absorb(&report);
                    }
                }
                Err(err) => {
                    error!(url = %url, error = %err, "listing could not be stored");
                    counts.errors += 1;
                }
            }
        }

        if self.images.is_some() {
            info!(
                downloaded = images.downloaded,
                already_present = images.already_present,
                failed = images.failed,
                "image downloads finished"
            );
        }
        Ok(())
    }

    async fn render_listing(&self, session: &mut dyn BrowserSession, url: &str) -> Result<String, SessionError> {
        session.navigate(url).await?;
        session.wait_for_element(DETAIL_READY_SELECTOR).await?;
        session.rendered_html().await
    }

}

async fn return_to_results(session: &mut dyn BrowserSession, search_url: &str) {
    if let Err(err) = session.navigate(search_url).await {
        debug!(error = %err, "could not return to results page");
    }
}

fn outcome(
    run_id: Uuid,
    started: Instant,
    success: bool,
    message: String,
    counts: ExtractionCounts,
) -> ExtractionOutcome {
    ExtractionOutcome {
        run_id,
        success,
        message,
        counts,
        duration_seconds: started.elapsed().as_secs_f64(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calp_adapters::StaticSession;
    use calp_storage::MemoryListingStore;

    const SEARCH: &str = "https://www.blocket.se/annonser/hela_sverige/fordon/bilar?q=porsche";

    fn settings() -> ExtractionSettings {
        ExtractionSettings {
            search_url: SEARCH.to_string(),
            listing_marker: "/annons/".to_string(),
            max_scrolls: 5,
        }
    }

    fn results_page() -> String {
        r#"<html><body>
            <button id="accept-cookies">OK</button>
            <a href="https://www.blocket.se/annons/111">Porsche 911</a>
            <a href="https://www.blocket.se/annons/222">Porsche Cayenne</a>
            <a href="https://www.blocket.se/annons/111">Porsche 911 again</a>
        </body></html>"#
            .to_string()
    }

    fn detail_page(title: &str, price: &str) -> String {
        format!(
            r#"<html><body><h1>{title}</h1><p class="price">{price}</p></body></html>"#
        )
    }

    #[tokio::test]
    async fn run_stores_each_discovered_listing_and_closes_the_session() {
        let store = Arc::new(MemoryListingStore::new());
        let pipeline = ExtractionPipeline::new(store.clone(), settings());
        let mut session = StaticSession::new()
            .with_page(SEARCH, results_page())
            .with_page("https://www.blocket.se/annons/111", detail_page("Porsche 911 Carrera", "1 195 000 kr"))
            .with_page("https://www.blocket.se/annons/222", detail_page("Porsche Cayenne", "640 000 kr"));

        let outcome = pipeline.run(&mut session).await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.counts.discovered, 2);
        assert_eq!(outcome.counts.total, 2);
        assert_eq!(outcome.counts.inserted, 2);
        assert!(session.is_closed());
        assert_eq!(store.len().await, 2);

        let mut session = StaticSession::new()
            .with_page(SEARCH, results_page())
            .with_page("https://www.blocket.se/annons/111", detail_page("Porsche 911 Carrera", "1 195 000 kr"))
            .with_page("https://www.blocket.se/annons/222", detail_page("Porsche Cayenne", "599 000 kr"));
        let rerun = pipeline.run(&mut session).await;
        assert_eq!(rerun.counts.unchanged, 1);
        assert_eq!(rerun.counts.updated, 1);
        assert_ne!(rerun.run_id, outcome.run_id);
    }

    #[tokio::test]
    async fn timed_out_listing_is_skipped_and_the_run_continues() {
        let store = Arc::new(MemoryListingStore::new());
        let pipeline = ExtractionPipeline::new(store.clone(), settings());
        let mut session = StaticSession::new()
            .with_page(SEARCH, results_page())
            .with_timeout("https://www.blocket.se/annons/111")
            .with_page("https://www.blocket.se/annons/222", detail_page("Porsche Cayenne", "640 000 kr"));

        let outcome = pipeline.run(&mut session).await;
        assert!(outcome.success);
        assert_eq!(outcome.counts.skipped, 1);
        assert_eq!(outcome.counts.inserted, 1);
        // after the timeout the session went back to the results page
        let visited = session.visited();
        let timeout_at = visited
            .iter()
            .position(|u| u == "https://www.blocket.se/annons/111")
            .unwrap();
        assert_eq!(visited[timeout_at + 1], SEARCH);
    }

    #[tokio::test]
    async fn unreachable_results_page_fails_the_run() {
        let store = Arc::new(MemoryListingStore::new());
        let pipeline = ExtractionPipeline::new(store.clone(), settings());
        let mut session = StaticSession::new();

        let outcome = pipeline.run(&mut session).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("navigation to"));
        assert_eq!(outcome.counts, ExtractionCounts::default());
        assert!(session.is_closed());
    }

    struct FailingLauncher;

    #[async_trait]
    impl SessionLauncher for FailingLauncher {
        async fn launch(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
            Err(SessionError::Launch("chromium not found".to_string()))
        }
    }

    #[tokio::test]
    async fn launch_failure_is_reported_as_failed_outcome() {
        let pipeline = ExtractionPipeline::new(Arc::new(MemoryListingStore::new()), settings());
        let outcome = pipeline.launch_and_run(&FailingLauncher).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("chromium not found"));
    }

    #[test]
    fn search_filter_rewrites_make_and_minimum_price() {
        let settings = ExtractionSettings {
            search_url: "https://www.blocket.se/annonser/hela_sverige/fordon/bilar?cg=1020&q=porsche&mys=400000&st=s".to_string(),
            ..settings()
        };
        assert_eq!(settings.search_url_for(&SearchFilter::default()).unwrap(), settings.search_url);

        let url = settings
            .search_url_for(&SearchFilter {
                make: Some("Volvo".to_string()),
                min_price: Some(150_000),
            })
            .unwrap();
        assert_eq!(
            url,
            "https://www.blocket.se/annonser/hela_sverige/fordon/bilar?cg=1020&st=s&q=volvo&mys=150000"
        );

        let url = settings
            .search_url_for(&SearchFilter {
                make: None,
                min_price: Some(250_000),
            })
            .unwrap();
        assert_eq!(
            url,
            "https://www.blocket.se/annonser/hela_sverige/fordon/bilar?cg=1020&q=porsche&st=s&mys=250000"
        );
    }

    #[tokio::test]
    async fn run_at_uses_the_given_search_page() {
        let narrowed = "https://www.blocket.se/annonser/hela_sverige/fordon/bilar?q=volvo";
        let pipeline = ExtractionPipeline::new(Arc::new(MemoryListingStore::new()), settings());
        let mut session = StaticSession::new()
            .with_page(narrowed, r#"<a href="https://www.blocket.se/annons/222">Volvo</a>"#)
            .with_page("https://www.blocket.se/annons/222", detail_page("Volvo V90", "289 000 kr"));

        let outcome = pipeline.run_at(&mut session, narrowed).await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.counts.inserted, 1);
        assert_eq!(session.visited()[0], narrowed);
    }
}
