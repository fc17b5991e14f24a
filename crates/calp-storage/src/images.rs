//! Listing image side-channel: retried HTTP fetches and atomic file writes
//! under `images/{listing_id}/{image_id}.jpg`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use calp_core::Listing;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ListingStore;

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub already_present: bool,
}

#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_path(&self, listing_id: &str, filename: &str) -> PathBuf {
        self.root.join(listing_id).join(filename)
    }

    pub async fn exists(&self, listing_id: &str, filename: &str) -> anyhow::Result<bool> {
        let path = self.image_path(listing_id, filename);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking image path {}", path.display()))
    }

    /// Write through a temp file and rename so a half-written image is never
    /// visible under its final name. An existing file is left as is.
    pub async fn store_bytes(
        &self,
        listing_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredImage> {
        let relative_path = PathBuf::from(listing_id).join(filename);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.root.join(listing_id);

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating image directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking image path {}", absolute_path.display()))?
        {
            return Ok(StoredImage {
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                already_present: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp image file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp image file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp image file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredImage {
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                already_present: false,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp image {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// How often one image URL is retried before it counts as failed.
#[derive(Debug, Clone, Copy)]
pub struct ImageRetry {
    pub retries: usize,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ImageRetry {
    fn default() -> Self {
        Self {
            retries: 2,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl ImageRetry {
    /// Pause before retry `retry` (0-based); doubles until `max_delay`.
    pub fn delay_before(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// CDN throttling, gateway faults and request timeouts; a missing or
/// hotlink-blocked image is final.
fn transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone)]
pub struct ImageFetchConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub retry: ImageRetry,
}

impl Default for ImageFetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            concurrency: 4,
            retry: ImageRetry::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("image request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("image {url} answered {status}")]
    HttpStatus { status: u16, url: String },
    #[error("image fetcher is shut down")]
    Closed,
}

/// Image HTTP client: bounded concurrency, retries on transient faults.
#[derive(Debug)]
pub struct ImageFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    retry: ImageRetry,
}

impl ImageFetcher {
    pub fn new(config: ImageFetchConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building image http client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            retry: config.retry,
        })
    }

    pub async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut retry = 0;
        loop {
            let reason = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.bytes().await?.to_vec()),
                Ok(resp) => {
                    let status = resp.status();
                    if !transient_status(status) || retry >= self.retry.retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    format!("status {status}")
                }
                Err(err) => {
                    if !transient_error(&err) || retry >= self.retry.retries {
                        return Err(FetchError::Request(err));
                    }
                    err.to_string()
                }
            };
            let delay = self.retry.delay_before(retry);
            debug!(url, retry, %reason, delay_ms = delay.as_millis() as u64, "image fetch will be retried");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageDownloadReport {
    pub downloaded: usize,
    pub already_present: usize,
    pub failed: usize,
}

impl ImageDownloadReport {
    pub fn absorb(&mut self, other: &ImageDownloadReport) {
        self.downloaded += other.downloaded;
        self.already_present += other.already_present;
        self.failed += other.failed;
    }
}

/// Best-effort image downloads for stored listings. Failures are logged and
/// counted; they never fail the surrounding extraction run.
#[derive(Debug)]
pub struct ImageDownloader {
    fetcher: ImageFetcher,
    images: ImageStore,
}

impl ImageDownloader {
    pub fn new(fetcher: ImageFetcher, images: ImageStore) -> Self {
        Self { fetcher, images }
    }

    pub fn image_store(&self) -> &ImageStore {
        &self.images
    }

    pub async fn download_listing_images(
        &self,
        store: &dyn ListingStore,
        listing: &Listing,
    ) -> ImageDownloadReport {
        let span = info_span!("image_download", listing_id = %listing.id, images = listing.images.len());
        self.download_inner(store, listing).instrument(span).await
    }

    async fn download_inner(&self, store: &dyn ListingStore, listing: &Listing) -> ImageDownloadReport {
        let mut report = ImageDownloadReport::default();

        for image in listing.images.iter().filter(|image| !image.downloaded) {
            match self.images.exists(&listing.id, &image.filename).await {
                Ok(true) => {
                    report.already_present += 1;
                    self.mark(store, listing, &image.url).await;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(image = %image.id, error = %err, "image path check failed");
                    report.failed += 1;
                    continue;
                }
            }

            let bytes = match self.fetcher.fetch_image(&image.url).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(image = %image.id, url = %image.url, error = %err, "image fetch failed");
                    report.failed += 1;
                    continue;
                }
            };

            match self.images.store_bytes(&listing.id, &image.filename, &bytes).await {
                Ok(stored) => {
                    if stored.already_present {
                        report.already_present += 1;
                    } else {
                        report.downloaded += 1;
                    }
                    self.mark(store, listing, &image.url).await;
                }
                Err(err) => {
                    warn!(image = %image.id, error = %err, "image write failed");
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn mark(&self, store: &dyn ListingStore, listing: &Listing, image_url: &str) {
        if let Err(err) = store.mark_image_downloaded(&listing.url, image_url).await {
            warn!(url = %listing.url, image_url, error = %err, "could not record image download");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryListingStore;
    use calp_core::Image;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn atomic_writes_leave_existing_files_alone() {
        let dir = tempdir().expect("tempdir");
        let store = ImageStore::new(dir.path());

        let first = store
            .store_bytes("1234", "1234_1.jpg", b"jpeg-bytes")
            .await
            .expect("first store");
        let second = store
            .store_bytes("1234", "1234_1.jpg", b"other-bytes")
            .await
            .expect("second store");

        assert!(!first.already_present);
        assert!(second.already_present);
        assert_eq!(first.relative_path, PathBuf::from("1234").join("1234_1.jpg"));
        assert_eq!(std::fs::read(&first.absolute_path).unwrap(), b"jpeg-bytes");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("1234"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    /// Answers each connection with the next status in `statuses`, then
    /// with 200 and `body`.
    async fn image_server(statuses: Vec<u16>, body: &'static [u8]) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let hit = counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let status = statuses.get(hit).copied().unwrap_or(200);
                let payload: &[u8] = if status == 200 { body } else { b"" };
                let head = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: {}\r\ncontent-type: image/jpeg\r\nconnection: close\r\n\r\n",
                    payload.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(payload).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn quick_fetcher(retries: usize) -> ImageFetcher {
        ImageFetcher::new(ImageFetchConfig {
            retry: ImageRetry {
                retries,
                first_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..Default::default()
        })
        .expect("client")
    }

    fn listing_with_image(url: String) -> Listing {
        let scraped_at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let mut listing = Listing::new("https://www.blocket.se/annons/stockholm/porsche/1234", scraped_at);
        listing.images = vec![Image::new("1234", 1, url)];
        listing
    }

    #[tokio::test]
    async fn throttled_image_is_retried_and_stored() {
        let (base, hits) = image_server(vec![429], b"jpeg-bytes").await;
        let dir = tempdir().expect("tempdir");
        let listing = listing_with_image(format!("{base}/1234_1.jpg"));
        let store = MemoryListingStore::new();
        store.upsert(&listing).await.unwrap();

        let downloader = ImageDownloader::new(quick_fetcher(2), ImageStore::new(dir.path()));
        let report = downloader.download_listing_images(&store, &listing).await;

        assert_eq!(report.downloaded, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(
            std::fs::read(dir.path().join("1234").join("1234_1.jpg")).unwrap(),
            b"jpeg-bytes"
        );
        let stored = store.get_by_url(&listing.url).await.unwrap();
        assert!(stored.images[0].downloaded);
    }

    #[tokio::test]
    async fn missing_image_is_not_retried_and_stays_pending() {
        let (base, hits) = image_server(vec![404, 404, 404], b"never").await;
        let dir = tempdir().expect("tempdir");
        let listing = listing_with_image(format!("{base}/1234_1.jpg"));
        let store = MemoryListingStore::new();
        store.upsert(&listing).await.unwrap();

        let downloader = ImageDownloader::new(quick_fetcher(2), ImageStore::new(dir.path()));
        let report = downloader.download_listing_images(&store, &listing).await;

        assert_eq!(report.failed, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("1234").join("1234_1.jpg").exists());
        assert!(!store.get_by_url(&listing.url).await.unwrap().images[0].downloaded);
    }

    #[tokio::test]
    async fn server_errors_give_up_after_the_retry_budget() {
        let (base, hits) = image_server(vec![503, 502, 500], b"late").await;
        let fetcher = quick_fetcher(1);
        let err = fetcher.fetch_image(&format!("{base}/1.jpg")).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 502, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let retry = ImageRetry::default();
        assert_eq!(retry.delay_before(0), Duration::from_millis(500));
        assert_eq!(retry.delay_before(1), Duration::from_secs(1));
        assert_eq!(retry.delay_before(30), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn files_already_on_disk_are_marked_without_fetching() {
        let dir = tempdir().expect("tempdir");
        let images = ImageStore::new(dir.path());
        images
            .store_bytes("1234", "1234_1.jpg", b"cached")
            .await
            .expect("seed image");

        let scraped_at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let mut listing = Listing::new("https://www.blocket.se/annons/1234", scraped_at);
        // unroutable url: a fetch attempt would fail the test
        listing.images = vec![Image::new("1234", 1, "http://127.0.0.1:9/1.jpg")];
        let store = MemoryListingStore::new();
        store.upsert(&listing).await.unwrap();

        let fetcher = quick_fetcher(0);
        let downloader = ImageDownloader::new(fetcher, images);
        let report = downloader.download_listing_images(&store, &listing).await;

        assert_eq!(
            report,
            ImageDownloadReport {
                downloaded: 0,
                already_present: 1,
                failed: 0
            }
        );
        let stored = store.get_by_url(&listing.url).await.unwrap();
        assert!(stored.images[0].downloaded);
    }
}
