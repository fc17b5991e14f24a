//! Marketplace adapters: browser session, listing discovery, field
//! extraction and normalization.

use calp_core::Listing;
use chrono::{DateTime, Utc};

pub mod discovery;
pub mod extract;
pub mod normalize;
pub mod selectors;
pub mod session;

pub use discovery::{
    discover_listing_urls, discover_static, resolve_live_hrefs, DEFAULT_LISTING_MARKER,
};
pub use extract::{extract_listing, RawListing, RawSeller};
pub use normalize::normalize;
pub use selectors::{first_match, Strategy};
pub use session::{
    BrowserSession, ChromeSession, SessionConfig, SessionError, StaticSession, CONSENT_SELECTORS,
};

pub const CRATE_NAME: &str = "calp-adapters";

/// Extract and normalize one rendered listing page.
pub fn parse_listing_page(url: &str, html: &str, scraped_at: DateTime<Utc>) -> Listing {
    normalize(extract_listing(url, html), scraped_at)
}
