//! Derived fields: numeric parses, facets, make/model, keywords and search
//! text. Pure and infallible: anything that cannot be derived stays `None`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use calp_core::{
    Image, Listing, Price, Seller, SellerType, UNKNOWN_DATE, UNKNOWN_LOCATION, UNKNOWN_PRICE,
    UNKNOWN_TITLE,
};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

use crate::extract::RawListing;

pub const MAKES: &[&str] = &[
    "Volvo",
    "Saab",
    "BMW",
    "Audi",
    "Mercedes",
    "Volkswagen",
    "VW",
    "Toyota",
    "Honda",
    "Mazda",
    "Ford",
    "Opel",
    "Peugeot",
    "Renault",
    "Porsche",
    "Ferrari",
    "Lamborghini",
    "Maserati",
    "Bentley",
    "Rolls-Royce",
];

pub const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d %B %Y", "%d %b %Y"];

const YEAR_KEYS: &[&str] = &["year", "årsmodell", "modellår"];
const MILEAGE_KEYS: &[&str] = &["mileage", "miltal"];
const FUEL_KEYS: &[&str] = &["fuel", "bränsle", "drivmedel"];
const TRANSMISSION_KEYS: &[&str] = &["transmission", "växellåda"];
const ENGINE_KEYS: &[&str] = &["engine", "motor"];
const COLOR_KEYS: &[&str] = &["color", "colour", "färg"];

static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{4}").expect("year pattern"));
static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z0-9]+").expect("token pattern"));
static MAKE_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    MAKES
        .iter()
        .map(|make| {
            let pattern = format!("(?i){}", regex::escape(make));
            (*make, Regex::new(&pattern).expect("make pattern"))
        })
        .collect()
});

pub fn normalize(raw: RawListing, scraped_at: DateTime<Utc>) -> Listing {
    let mut listing = Listing::new(raw.url, scraped_at);

    listing.price = Price::new(parse_digits(&raw.price_text));
    listing.price_text = raw.price_text;
    listing.vat_price = raw.vat_price_text.as_deref().and_then(parse_digits);
    listing.vat_price_text = raw.vat_price_text;
    listing.financing_monthly = raw.financing_text.as_deref().and_then(parse_digits);
    listing.financing_text = raw.financing_text;

    if raw.location != UNKNOWN_LOCATION {
        let (city, region) = split_location(&raw.location);
        listing.city = city;
        listing.region = region;
    }
    listing.location = raw.location;

    listing.description_length = raw.description.chars().count();
    listing.description = raw.description;

    for (key, value) in &raw.specifications {
        listing.specifications.insert(key.clone(), value.clone());
        listing.normalized_specs.insert(normalize_key(key), value.clone());
    }
    let facets = Facets::derive(&raw.specifications);
    listing.year = facets.year;
    listing.mileage = facets.mileage;
    listing.fuel_type = facets.fuel_type;
    listing.transmission = facets.transmission;
    listing.engine = facets.engine;
    listing.color = facets.color;

    let (make, model) = resolve_make_model(&listing.normalized_specs, &raw.title);
    listing.make = make;
    listing.model = model;
    listing.title = raw.title;

    listing.seller = Seller {
        info: raw.seller.info,
        name: raw.seller.name,
        kind: raw.seller.type_text.as_deref().map(SellerType::from_label),
    };
    listing.tags = raw.tags;

    listing.publication_timestamp = parse_publication_date(&raw.publication_date);
    listing.publication_date = raw.publication_date;

    let images = raw
        .image_urls
        .into_iter()
        .enumerate()
        .map(|(idx, url)| Image::new(&listing.id, idx as u32 + 1, url))
        .collect();
    listing.set_images(images);

    listing.search_text = search_text(&listing, &raw.specifications);
    listing.keywords = keywords(&listing);
    listing
}

/// Digits only; `None` when there are none or the number does not fit.
pub fn parse_digits(text: &str) -> Option<i64> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace([' ', '-'], "_")
}

pub fn split_location(location: &str) -> (Option<String>, Option<String>) {
    let mut parts = location.split(',').map(|part| part.trim().to_string());
    let city = parts.next().filter(|p| !p.is_empty());
    let region = parts.next().filter(|p| !p.is_empty());
    (city, region)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Facets {
    year: Option<i32>,
    mileage: Option<i64>,
    fuel_type: Option<String>,
    transmission: Option<String>,
    engine: Option<String>,
    color: Option<String>,
}

impl Facets {
    /// Per field, the first spec row whose key or value mentions one of the
    /// field's keywords and yields a usable value.
    fn derive(rows: &[(String, String)]) -> Self {
        let mut facets = Facets::default();
        for (key, value) in rows {
            let haystack = format!("{} {}", key.to_lowercase(), value.to_lowercase());
            let mentions = |keys: &[&str]| keys.iter().any(|k| haystack.contains(k));
            let text = || Some(value.trim().to_string()).filter(|v| !v.is_empty());

            if facets.year.is_none() && mentions(YEAR_KEYS) {
                facets.year = YEAR.find(value).and_then(|m| m.as_str().parse().ok());
            }
            if facets.mileage.is_none() && mentions(MILEAGE_KEYS) {
                facets.mileage = parse_digits(value);
            }
            if facets.fuel_type.is_none() && mentions(FUEL_KEYS) {
                facets.fuel_type = text();
            }
            if facets.transmission.is_none() && mentions(TRANSMISSION_KEYS) {
                facets.transmission = text();
            }
            if facets.engine.is_none() && mentions(ENGINE_KEYS) {
                facets.engine = text();
            }
            if facets.color.is_none() && mentions(COLOR_KEYS) {
                facets.color = text();
            }
        }
        facets
    }
}

/// Explicit spec fields first; whichever of make/model is still missing is
/// taken from the title scan.
pub fn resolve_make_model(
    normalized_specs: &BTreeMap<String, String>,
    title: &str,
) -> (Option<String>, Option<String>) {
    let spec = |keys: [&str; 2]| {
        keys.iter()
            .filter_map(|k| normalized_specs.get(*k))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    };
    let mut make = spec(["make", "märke"]);
    let mut model = spec(["model", "modell"]);

    if make.is_none() || model.is_none() {
        if let Some((title_make, title_model)) = scan_title(title) {
            make = make.or(Some(title_make.to_string()));
            model = model.or(title_model);
        }
    }
    (make, model)
}

/// First vocabulary make found in the title, and the next alphanumeric
/// token after it.
pub fn scan_title(title: &str) -> Option<(&'static str, Option<String>)> {
    if title == UNKNOWN_TITLE {
        return None;
    }
    MAKE_PATTERNS.iter().find_map(|(make, pattern)| {
        let found = pattern.find(title)?;
        let model = TOKEN
            .find(&title[found.end()..])
            .map(|m| m.as_str().to_string());
        Some((*make, model))
    })
}

/// Unix seconds at midnight UTC of the first format that parses.
pub fn parse_publication_date(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() || text == UNKNOWN_DATE {
        return None;
    }
    DATE_FORMATS.iter().find_map(|format| {
        NaiveDate::parse_from_str(text, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|midnight| midnight.and_utc().timestamp())
    })
}

fn search_text(listing: &Listing, specs: &[(String, String)]) -> String {
    let mut parts: Vec<String> = Vec::new();
    if listing.title != UNKNOWN_TITLE {
        parts.push(listing.title.clone());
    }
    if listing.price_text != UNKNOWN_PRICE {
        parts.push(listing.price_text.clone());
    }
    if listing.location != UNKNOWN_LOCATION {
        parts.push(listing.location.clone());
    }
    if !listing.description.is_empty() {
        parts.push(listing.description.clone());
    }
    parts.extend(specs.iter().map(|(k, v)| format!("{k} {v}")));
    parts.extend(listing.tags.iter().cloned());
    if let Some(info) = &listing.seller.info {
        parts.push(info.clone());
    }
    parts.retain(|p| !p.trim().is_empty());
    parts.join(" ")
}

fn keywords(listing: &Listing) -> BTreeSet<String> {
    let year = listing.year.map(|y| y.to_string());
    let seller_type = listing.seller.kind.map(|k| k.as_str().to_string());
    [
        listing.make.as_ref(),
        listing.model.as_ref(),
        year.as_ref(),
        listing.fuel_type.as_ref(),
        listing.transmission.as_ref(),
        listing.color.as_ref(),
        seller_type.as_ref(),
    ]
    .into_iter()
    .flatten()
    .chain(listing.tags.iter())
    .map(|k| k.trim().to_lowercase())
    .filter(|k| !k.is_empty())
    .collect()
}
