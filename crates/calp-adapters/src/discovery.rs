use std::collections::HashSet;

use scraper::Html;
use tracing::{debug, info, warn};
use url::Url;

use crate::selectors::select;
use crate::session::BrowserSession;

pub const DEFAULT_LISTING_MARKER: &str = "/annons/";

pub fn is_listing_url(href: &str, marker: &str) -> bool {
    (href.starts_with("http://") || href.starts_with("https://")) && href.contains(marker)
}

/// Absolute listing links found in the static document, deduplicated in
/// page order.
pub fn discover_static(html: &str, marker: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let hrefs = select(&document, "a[href]")
        .into_iter()
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| is_listing_url(href, marker))
        .map(str::to_string);
    dedup_in_order(hrefs)
}

/// Listing links from live anchors. Relative hrefs resolve against `base`.
pub fn resolve_live_hrefs(hrefs: &[String], base: Option<&Url>, marker: &str) -> Vec<String> {
    let resolved = hrefs.iter().filter_map(|href| {
        let href = href.trim();
        if href.is_empty() {
            return None;
        }
        match Url::parse(href) {
            Ok(url) => Some(url.to_string()),
            Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(href).ok().map(String::from),
            Err(_) => None,
        }
    });
    dedup_in_order(resolved.filter(|href| is_listing_url(href, marker)))
}

fn dedup_in_order(hrefs: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    hrefs.filter(|href| seen.insert(href.clone())).collect()
}

/// Static parse first; the live DOM is queried only when that finds nothing,
/// e.g. when links are attached by script after render.
pub async fn discover_listing_urls(
    session: &mut dyn BrowserSession,
    html: &str,
    marker: &str,
) -> Vec<String> {
    let found = discover_static(html, marker);
    if !found.is_empty() {
        info!(count = found.len(), "listing urls discovered from static document");
        return found;
    }

    let hrefs = match session.live_anchor_hrefs().await {
        Ok(hrefs) => hrefs,
        Err(err) => {
            warn!(error = %err, "live anchor query failed");
            return Vec::new();
        }
    };
    let base = match session.current_url().await {
        Ok(current) => Url::parse(&current).ok(),
        Err(err) => {
            debug!(error = %err, "current url unavailable; relative anchors dropped");
            None
        }
    };
    let found = resolve_live_hrefs(&hrefs, base.as_ref(), marker);
    info!(count = found.len(), "listing urls discovered from live anchors");
    found
}
