//! Browser session seam. [`ChromeSession`] drives a headless Chromium over
//! the devtools protocol; [`StaticSession`] serves canned pages and backs
//! tests and offline replays.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CONSENT_SELECTORS: &[&str] = &[
    "button[data-testid='accept-all-cookies-button']",
    "button.cookie-consent-accept-button",
    "button.accept-cookies",
    "button[aria-label='Accept cookies']",
    "#accept-cookies",
    ".accept-cookies-button",
];

const ELEMENT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },
    #[error("devtools protocol error: {0}")]
    Cdp(String),
}

impl From<CdpError> for SessionError {
    fn from(err: CdpError) -> Self {
        SessionError::Cdp(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub page_load_timeout: Duration,
    pub element_timeout: Duration,
    pub user_agent: Option<String>,
    /// Settle time after each scroll before the page height is re-read.
    pub scroll_pause: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_load_timeout: Duration::from_secs(60),
            element_timeout: Duration::from_secs(15),
            user_agent: None,
            scroll_pause: Duration::from_secs(2),
        }
    }
}

/// One browser tab, used strictly sequentially.
#[async_trait]
pub trait BrowserSession: Send {
    /// Load `url` and wait for navigation to finish within the page-load
    /// ceiling.
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError>;

    async fn wait_for_element(&mut self, selector: &str) -> Result<(), SessionError>;

    async fn current_url(&mut self) -> Result<String, SessionError>;

    async fn rendered_html(&mut self) -> Result<String, SessionError>;

    /// Scroll to the bottom until the page height stops growing or
    /// `max_scrolls` is reached. Returns the number of scrolls that grew
    /// the page.
    async fn scroll_to_stable(&mut self, max_scrolls: usize) -> Result<usize, SessionError>;

    /// Click the first consent button present. Returns the selector that
    /// matched, if any.
    async fn dismiss_consent(&mut self, selectors: &[&str]) -> Result<Option<String>, SessionError>;

    /// Resolved `href` of every anchor in the live DOM.
    async fn live_anchor_hrefs(&mut self) -> Result<Vec<String>, SessionError>;

    async fn close(&mut self) -> Result<(), SessionError>;
}

pub struct ChromeSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    config: SessionConfig,
    closed: bool,
}

impl ChromeSession {
    pub async fn launch(config: SessionConfig) -> Result<Self, SessionError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-dev-shm-usage");
        if let Some(user_agent) = &config.user_agent {
            builder = builder.arg(format!("--user-agent={user_agent}"));
        }
        let browser_config = builder.build().map_err(SessionError::Launch)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "devtools handler event error");
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                handler.abort();
                return Err(SessionError::Launch(err.to_string()));
            }
        };
        info!("browser session launched");

        Ok(Self {
            browser,
            page,
            handler,
            config,
            closed: false,
        })
    }

    async fn scroll_height(&self) -> Result<f64, SessionError> {
        self.page
            .evaluate("document.body.scrollHeight")
            .await?
            .into_value::<f64>()
            .map_err(|e| SessionError::Cdp(e.to_string()))
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        let after = self.config.page_load_timeout;
        let page = &self.page;
        let load = async {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            Ok::<(), CdpError>(())
        };
        match tokio::time::timeout(after, load).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SessionError::Navigation {
                url: url.to_string(),
                message: err.to_string(),
            }),
            Err(_) => Err(SessionError::Timeout {
                what: format!("page load of {url}"),
                after,
            }),
        }
    }

    async fn wait_for_element(&mut self, selector: &str) -> Result<(), SessionError> {
        let after = self.config.element_timeout;
        let page = &self.page;
        let poll = async {
            while page.find_element(selector).await.is_err() {
                tokio::time::sleep(ELEMENT_POLL).await;
            }
        };
        tokio::time::timeout(after, poll)
            .await
            .map_err(|_| SessionError::Timeout {
                what: format!("element {selector}"),
                after,
            })
    }

    async fn current_url(&mut self) -> Result<String, SessionError> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn rendered_html(&mut self) -> Result<String, SessionError> {
        Ok(self.page.content().await?)
    }

    async fn scroll_to_stable(&mut self, max_scrolls: usize) -> Result<usize, SessionError> {
        let mut last_height = self.scroll_height().await?;
        let mut scrolls = 0;
        while scrolls < max_scrolls {
            self.page
                .evaluate("window.scrollTo(0, document.body.scrollHeight); document.body.scrollHeight")
                .await?;
            tokio::time::sleep(self.config.scroll_pause).await;

            let height = self.scroll_height().await?;
            if height <= last_height {
                break;
            }
            last_height = height;
            scrolls += 1;
            debug!(scrolls, height, "page grew after scroll");
        }
        Ok(scrolls)
    }

    async fn dismiss_consent(&mut self, selectors: &[&str]) -> Result<Option<String>, SessionError> {
        for selector in selectors {
            let Ok(button) = self.page.find_element(*selector).await else {
                continue;
            };
            match button.click().await {
                Ok(_) => {
                    info!(selector, "consent dialog dismissed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    return Ok(Some(selector.to_string()));
                }
                Err(err) => debug!(selector, error = %err, "consent button not clickable"),
            }
        }
        Ok(None)
    }

    async fn live_anchor_hrefs(&mut self) -> Result<Vec<String>, SessionError> {
        self.page
            .evaluate("Array.from(document.querySelectorAll('a[href]')).map(a => a.href)")
            .await?
            .into_value::<Vec<String>>()
            .map_err(|e| SessionError::Cdp(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "browser close failed");
        }
        if let Err(err) = self.browser.wait().await {
            warn!(error = %err, "waiting for browser exit failed");
        }
        self.handler.abort();
        info!("browser session closed");
        Ok(())
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        // the browser process itself is killed by Browser's own Drop
        self.handler.abort();
    }
}

/// Serves pre-recorded pages by URL. Unknown URLs fail navigation; URLs
/// registered with [`StaticSession::with_timeout`] time out.
#[derive(Debug, Default, Clone)]
pub struct StaticSession {
    pages: HashMap<String, String>,
    timeouts: Vec<String>,
    live_hrefs: Vec<String>,
    current: Option<String>,
    visited: Vec<String>,
    closed: bool,
}

impl StaticSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    pub fn with_timeout(mut self, url: impl Into<String>) -> Self {
        self.timeouts.push(url.into());
        self
    }

    /// Anchors only visible in the live DOM (added after render). Without
    /// these the live query returns the current page's raw hrefs.
    pub fn with_live_hrefs(mut self, hrefs: Vec<String>) -> Self {
        self.live_hrefs = hrefs;
        self
    }

    pub fn visited(&self) -> &[String] {
        &self.visited
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl BrowserSession for StaticSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        self.visited.push(url.to_string());
        if self.timeouts.iter().any(|u| u == url) {
            return Err(SessionError::Timeout {
                what: format!("page load of {url}"),
                after: Duration::ZERO,
            });
        }
        if !self.pages.contains_key(url) {
            return Err(SessionError::Navigation {
                url: url.to_string(),
                message: "no recorded page".to_string(),
            });
        }
        self.current = Some(url.to_string());
        Ok(())
    }

    async fn wait_for_element(&mut self, selector: &str) -> Result<(), SessionError> {
        let html = self.rendered_html().await?;
        let document = scraper::Html::parse_document(&html);
        if crate::selectors::select(&document, selector).is_empty() {
            Err(SessionError::Timeout {
                what: format!("element {selector}"),
                after: Duration::ZERO,
            })
        } else {
            Ok(())
        }
    }

    async fn current_url(&mut self) -> Result<String, SessionError> {
        Ok(self.current.clone().unwrap_or_default())
    }

    async fn rendered_html(&mut self) -> Result<String, SessionError> {
        self.current
            .as_ref()
            .and_then(|url| self.pages.get(url))
            .cloned()
            .ok_or_else(|| SessionError::Cdp("no page loaded".to_string()))
    }

    async fn scroll_to_stable(&mut self, _max_scrolls: usize) -> Result<usize, SessionError> {
        Ok(0)
    }

    async fn dismiss_consent(&mut self, selectors: &[&str]) -> Result<Option<String>, SessionError> {
        let html = self.rendered_html().await?;
        let document = scraper::Html::parse_document(&html);
        Ok(selectors
            .iter()
            .find(|selector| !crate::selectors::select(&document, selector).is_empty())
            .map(|selector| selector.to_string()))
    }

    async fn live_anchor_hrefs(&mut self) -> Result<Vec<String>, SessionError> {
        if !self.live_hrefs.is_empty() {
            return Ok(self.live_hrefs.clone());
        }
        let html = self.rendered_html().await?;
        let document = scraper::Html::parse_document(&html);
        Ok(crate::selectors::select(&document, "a[href]")
            .into_iter()
            .filter_map(|a| a.value().attr("href"))
            .map(str::to_string)
            .collect())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_session_serves_recorded_pages() {
        let mut session = StaticSession::new()
            .with_page("https://a.test/", r#"<button id="accept-cookies">OK</button><h1>Hej</h1>"#)
            .with_timeout("https://a.test/slow");

        session.navigate("https://a.test/").await.unwrap();
        assert!(session.rendered_html().await.unwrap().contains("Hej"));
        assert!(session.wait_for_element("h1").await.is_ok());
        assert!(matches!(
            session.wait_for_element("table").await,
            Err(SessionError::Timeout { .. })
        ));
        assert_eq!(
            session.dismiss_consent(CONSENT_SELECTORS).await.unwrap().as_deref(),
            Some("#accept-cookies")
        );

        assert!(matches!(
            session.navigate("https://a.test/slow").await,
            Err(SessionError::Timeout { .. })
        ));
        assert!(matches!(
            session.navigate("https://a.test/missing").await,
            Err(SessionError::Navigation { .. })
        ));
        // a failed navigation leaves the previous page loaded
        assert_eq!(session.current_url().await.unwrap(), "https://a.test/");

        session.close().await.unwrap();
        assert!(session.is_closed());
        assert_eq!(session.visited().len(), 3);
    }

    #[test]
    fn session_errors_render_context() {
        let err = SessionError::Navigation {
            url: "https://a.test/".into(),
            message: "net::ERR_NAME_NOT_RESOLVED".into(),
        };
        assert_eq!(
            err.to_string(),
            "navigation to https://a.test/ failed: net::ERR_NAME_NOT_RESOLVED"
        );
    }
}
