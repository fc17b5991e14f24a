//! Core domain model for CALP: listings, images, sellers and run outcomes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "calp-core";

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_PRICE: &str = "Unknown Price";
pub const UNKNOWN_LOCATION: &str = "Unknown Location";
pub const UNKNOWN_DATE: &str = "Unknown";

/// Fixed price bands used for faceted search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PriceRange {
    #[serde(rename = "Under 100,000 kr")]
    Under100k,
    #[serde(rename = "100,000 - 200,000 kr")]
    From100kTo200k,
    #[serde(rename = "200,000 - 300,000 kr")]
    From200kTo300k,
    #[serde(rename = "300,000 - 500,000 kr")]
    From300kTo500k,
    #[serde(rename = "500,000 - 1,000,000 kr")]
    From500kTo1m,
    #[serde(rename = "Over 1,000,000 kr")]
    Over1m,
}

impl PriceRange {
    /// Half-open bands: a boundary value belongs to the higher band.
    pub fn for_amount(amount: i64) -> Self {
        match amount {
            i64::MIN..=99_999 => Self::Under100k,
            100_000..=199_999 => Self::From100kTo200k,
            200_000..=299_999 => Self::From200kTo300k,
            300_000..=499_999 => Self::From300kTo500k,
            500_000..=999_999 => Self::From500kTo1m,
            _ => Self::Over1m,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Under100k => "Under 100,000 kr",
            Self::From100kTo200k => "100,000 - 200,000 kr",
            Self::From200kTo300k => "200,000 - 300,000 kr",
            Self::From300kTo500k => "300,000 - 500,000 kr",
            Self::From500kTo1m => "500,000 - 1,000,000 kr",
            Self::Over1m => "Over 1,000,000 kr",
        }
    }
}

/// Asking price. The band is recomputed from the amount on every
/// (de)serialization so the two can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "PriceFields", into = "PriceFields")]
pub struct Price {
    amount: Option<i64>,
}

impl Price {
    pub fn new(amount: Option<i64>) -> Self {
        Self { amount }
    }

    pub fn amount(&self) -> Option<i64> {
        self.amount
    }

    pub fn range(&self) -> Option<PriceRange> {
        self.amount.map(PriceRange::for_amount)
    }
}

#[derive(Serialize, Deserialize)]
struct PriceFields {
    #[serde(default)]
    price: Option<i64>,
    #[serde(default)]
    price_range: Option<PriceRange>,
}

impl From<PriceFields> for Price {
    fn from(fields: PriceFields) -> Self {
        Price::new(fields.price)
    }
}

impl From<Price> for PriceFields {
    fn from(price: Price) -> Self {
        PriceFields {
            price: price.amount(),
            price_range: price.range(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SellerType {
    Private,
    Dealer,
    Unknown,
}

impl SellerType {
    pub fn from_label(label: &str) -> Self {
        let lower = label.to_lowercase();
        if lower.contains("privat") {
            Self::Private
        } else if lower.contains("handel") || lower.contains("dealer") {
            Self::Dealer
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Dealer => "dealer",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Seller {
    pub info: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<SellerType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub url: String,
    pub position: u32,
    pub is_primary: bool,
    pub filename: String,
    pub local_path: String,
    pub downloaded: bool,
}

impl Image {
    /// `ordinal` is 1-based discovery order within one extraction pass.
    pub fn new(listing_id: &str, ordinal: u32, url: impl Into<String>) -> Self {
        let id = format!("{listing_id}_{ordinal}");
        Self {
            filename: format!("{id}.jpg"),
            local_path: format!("images/{listing_id}/{id}.jpg"),
            id,
            url: url.into(),
            position: ordinal,
            is_primary: ordinal == 1,
            downloaded: false,
        }
    }
}

/// One scraped marketplace ad, keyed by its source URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub url: String,
    pub title: String,
    pub price_text: String,
    #[serde(flatten)]
    pub price: Price,
    pub vat_price_text: Option<String>,
    pub vat_price: Option<i64>,
    pub financing_text: Option<String>,
    pub financing_monthly: Option<i64>,
    pub location: String,
    pub city: Option<String>,
    pub region: Option<String>,
    pub description: String,
    pub description_length: usize,
    pub specifications: BTreeMap<String, String>,
    pub normalized_specs: BTreeMap<String, String>,
    pub year: Option<i32>,
    pub mileage: Option<i64>,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub engine: Option<String>,
    pub color: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub tags: Vec<String>,
    pub seller: Seller,
    pub publication_date: String,
    pub publication_timestamp: Option<i64>,
    pub images: Vec<Image>,
    #[serde(default)]
    pub image_count: usize,
    #[serde(default)]
    pub has_images: bool,
    #[serde(default)]
    pub primary_image: Option<String>,
    pub search_text: String,
    pub keywords: BTreeSet<String>,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub last_indexed: Option<DateTime<Utc>>,
    pub active: bool,
    pub scrape_date: DateTime<Utc>,
    pub scrape_timestamp: i64,
}

impl Listing {
    /// A listing with every extracted field at its sentinel value.
    pub fn new(url: impl Into<String>, scraped_at: DateTime<Utc>) -> Self {
        let url = url.into();
        Self {
            id: listing_id_from_url(&url),
            url,
            title: UNKNOWN_TITLE.to_string(),
            price_text: UNKNOWN_PRICE.to_string(),
            price: Price::default(),
            vat_price_text: None,
            vat_price: None,
            financing_text: None,
            financing_monthly: None,
            location: UNKNOWN_LOCATION.to_string(),
            city: None,
            region: None,
            description: String::new(),
            description_length: 0,
            specifications: BTreeMap::new(),
            normalized_specs: BTreeMap::new(),
            year: None,
            mileage: None,
            fuel_type: None,
            transmission: None,
            engine: None,
            color: None,
            make: None,
            model: None,
            tags: Vec::new(),
            seller: Seller::default(),
            publication_date: UNKNOWN_DATE.to_string(),
            publication_timestamp: None,
            images: Vec::new(),
            image_count: 0,
            has_images: false,
            primary_image: None,
            search_text: String::new(),
            keywords: BTreeSet::new(),
            indexed: false,
            last_indexed: None,
            active: true,
            scrape_date: scraped_at,
            scrape_timestamp: scraped_at.timestamp(),
        }
    }

    pub fn price_range(&self) -> Option<PriceRange> {
        self.price.range()
    }

    /// Replace the images and refresh the count, flag and primary URL.
    pub fn set_images(&mut self, images: Vec<Image>) {
        self.image_count = images.len();
        self.has_images = !images.is_empty();
        self.primary_image = images
            .iter()
            .find(|image| image.is_primary)
            .or_else(|| images.first())
            .map(|image| image.url.clone());
        self.images = images;
    }

    /// Search-index document id: the natural id, falling back to the URL.
    pub fn document_id(&self) -> &str {
        if self.id.trim().is_empty() {
            &self.url
        } else {
            &self.id
        }
    }
}

/// Last non-empty path segment of a listing URL, without query or fragment.
pub fn listing_id_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionCounts {
    pub discovered: usize,
    pub total: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl ExtractionCounts {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Structured result of one extraction run, returned even on fatal faults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub run_id: Uuid,
    pub success: bool,
    pub message: String,
    pub counts: ExtractionCounts,
    pub duration_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

impl ExtractionOutcome {
    /// A run that failed before any listing was touched.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            success: false,
            message: message.into(),
            counts: ExtractionCounts::default(),
            duration_seconds: 0.0,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub pending: usize,
    pub indexed: usize,
    pub failed: usize,
    pub marked: usize,
    pub mark_errors: usize,
}

/// Structured result of one store→index replication run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub success: bool,
    pub message: String,
    pub counts: SyncCounts,
    pub duration_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

impl SyncOutcome {
    /// A run that failed before anything was read from the store.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            success: false,
            message: message.into(),
            counts: SyncCounts::default(),
            duration_seconds: 0.0,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
    }

    #[test]
    fn price_bands_cover_the_six_ranges_in_order() {
        let bands: Vec<_> = [50_000, 150_000, 250_000, 400_000, 750_000, 2_000_000]
            .into_iter()
            .map(PriceRange::for_amount)
            .collect();
        assert_eq!(
            bands,
            vec![
                PriceRange::Under100k,
                PriceRange::From100kTo200k,
                PriceRange::From200kTo300k,
                PriceRange::From300kTo500k,
                PriceRange::From500kTo1m,
                PriceRange::Over1m,
            ]
        );
        assert_eq!(PriceRange::for_amount(100_000), PriceRange::From100kTo200k);
        assert_eq!(PriceRange::for_amount(1_000_000), PriceRange::Over1m);
        assert_eq!(PriceRange::for_amount(0), PriceRange::Under100k);
    }

    #[test]
    fn stored_price_range_is_ignored_and_recomputed() {
        let mut listing = Listing::new("https://www.blocket.se/annons/111", ts());
        listing.price = Price::new(Some(450_000));
        let mut value = serde_json::to_value(&listing).unwrap();
        assert_eq!(value["price"], 450_000);
        assert_eq!(value["price_range"], "300,000 - 500,000 kr");

        value["price_range"] = serde_json::json!("Under 100,000 kr");
        let back: Listing = serde_json::from_value(value).unwrap();
        assert_eq!(back.price_range(), Some(PriceRange::From300kTo500k));
        assert_eq!(back, listing);
    }

    #[test]
    fn missing_price_serializes_as_nulls() {
        let listing = Listing::new("https://www.blocket.se/annons/111", ts());
        let value = serde_json::to_value(&listing).unwrap();
        assert!(value["price"].is_null());
        assert!(value["price_range"].is_null());
        assert_eq!(value["title"], UNKNOWN_TITLE);
    }

    #[test]
    fn listing_id_is_last_path_segment() {
        assert_eq!(listing_id_from_url("https://www.blocket.se/annons/stockholm/porsche_911/1234"), "1234");
        assert_eq!(listing_id_from_url("https://www.blocket.se/annons/1234/"), "1234");
        assert_eq!(listing_id_from_url("https://www.blocket.se/annons/1234?ref=list#top"), "1234");
    }

    #[test]
    fn images_get_deterministic_names() {
        let first = Image::new("1234", 1, "https://img.example/a.jpg");
        let second = Image::new("1234", 2, "https://img.example/b.jpg");
        assert_eq!(first.id, "1234_1");
        assert!(first.is_primary);
        assert!(!second.is_primary);
        assert_eq!(second.filename, "1234_2.jpg");
        assert_eq!(second.local_path, "images/1234/1234_2.jpg");
        assert!(!second.downloaded);
    }

    #[test]
    fn seller_type_labels_normalize() {
        assert_eq!(SellerType::from_label("Privatperson"), SellerType::Private);
        assert_eq!(SellerType::from_label("Bilhandel"), SellerType::Dealer);
        assert_eq!(SellerType::from_label("Dealer"), SellerType::Dealer);
        assert_eq!(SellerType::from_label("Företag"), SellerType::Unknown);
        let seller = Seller {
            info: Some("Bilhandlaren AB".into()),
            name: None,
            kind: Some(SellerType::Dealer),
        };
        assert_eq!(serde_json::to_value(&seller).unwrap()["type"], "dealer");
    }

    #[test]
    fn document_id_falls_back_to_url() {
        let mut listing = Listing::new("https://www.blocket.se/annons/1234", ts());
        assert_eq!(listing.document_id(), "1234");
        listing.id.clear();
        assert_eq!(listing.document_id(), "https://www.blocket.se/annons/1234");
    }

    #[test]
    fn failed_outcomes_carry_zero_counts_and_fresh_run_ids() {
        let first = ExtractionOutcome::failed("connecting listing store: connection refused");
        let second = ExtractionOutcome::failed("connecting listing store: connection refused");
        assert!(!first.success);
        assert_eq!(first.counts, ExtractionCounts::default());
        assert_ne!(first.run_id, second.run_id);

        let sync = SyncOutcome::failed("missing required environment variable DATABASE_URL");
        assert!(!sync.success);
        assert_eq!(sync.counts, SyncCounts::default());
        let json = serde_json::to_value(&sync).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["counts"]["pending"], 0);
        assert_eq!(json["message"], "missing required environment variable DATABASE_URL");
    }

    #[test]
    fn image_summary_follows_the_image_list() {
        let mut listing = Listing::new("https://www.blocket.se/annons/stockholm/porsche/1234", ts());
        assert_eq!(listing.image_count, 0);
        assert!(!listing.has_images);

        listing.set_images(vec![
            Image::new("1234", 1, "https://img.example/a.jpg"),
            Image::new("1234", 2, "https://img.example/b.jpg"),
        ]);
        assert_eq!(listing.image_count, 2);
        assert!(listing.has_images);
        assert_eq!(listing.primary_image.as_deref(), Some("https://img.example/a.jpg"));

        listing.set_images(Vec::new());
        assert_eq!(listing.primary_image, None);
        assert!(!listing.has_images);
    }
}
