//! Field extraction from a rendered listing page.
//!
//! Every field is looked up independently through its own fallback chain;
//! a field that cannot be found gets its sentinel and a warning, never an
//! error.

use calp_core::{UNKNOWN_DATE, UNKNOWN_LOCATION, UNKNOWN_PRICE, UNKNOWN_TITLE};
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::selectors::{element_text, first_match, select, select_within, Strategy};

pub const TITLE: &[Strategy] = &[
    Strategy::Text("h1"),
    Strategy::Text("h1.title"),
    Strategy::Text("h1[data-testid='ad-title']"),
];

pub const PRICE: &[Strategy] = &[
    Strategy::Text("p.price"),
    Strategy::Text("span.price"),
    Strategy::Text("[data-testid='price-tag']"),
    Strategy::Text(".price-tag"),
];

pub const VAT_PRICE: &[Strategy] = &[
    Strategy::Text(".vat-price"),
    Strategy::Text("[data-testid='vat-price']"),
    Strategy::TextContaining {
        selector: "span",
        needle: "Moms",
    },
    Strategy::TextContaining {
        selector: "span",
        needle: "moms",
    },
    Strategy::TextContaining {
        selector: "div",
        needle: "inkl. moms",
    },
];

pub const FINANCING: &[Strategy] = &[
    Strategy::Text(".financing"),
    Strategy::Text("[data-testid='financing']"),
    Strategy::TextContaining {
        selector: "span",
        needle: "Finansiering",
    },
    Strategy::TextContaining {
        selector: "div",
        needle: "kr/mån",
    },
    Strategy::Text(".monthly-payment"),
];

pub const LOCATION: &[Strategy] = &[
    Strategy::Text(".location"),
    Strategy::Text("span.location"),
    Strategy::Text("[data-testid='location']"),
];

pub const DESCRIPTION: &[Strategy] = &[
    Strategy::Text(".description"),
    Strategy::Text("[data-testid='description']"),
    Strategy::Text(".body-text"),
];

pub const PUBLICATION_DATE: &[Strategy] = &[
    Strategy::Text(".date"),
    Strategy::Text("[data-testid='publication-date']"),
    Strategy::Text(".publication-date"),
];

pub const IMAGE_SELECTORS: &[&str] = &[
    "img.image",
    "img[data-testid='image']",
    ".gallery img",
    ".carousel img",
];

pub const TAG_SELECTORS: &[&str] = &[".tags", ".tag", "[data-testid='tags']", ".badges"];

pub const SELLER_SELECTORS: &[&str] = &[".seller", "[data-testid='seller']", ".contact-info"];

pub const SPEC_CONTAINERS: &[&str] = &[
    ".specifications",
    ".details",
    "[data-testid='specifications']",
    ".parameter-list",
    "dl.specs",
];

const KEY_VALUE_ROWS: &str = ".key-value, .parameter, .spec-item";
const KEY_VALUE_KEYS: &str = ".key, .label, .name";
const KEY_VALUE_VALUES: &str = ".value, .data";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSeller {
    pub info: Option<String>,
    pub name: Option<String>,
    pub type_text: Option<String>,
}

/// Field values as they appear on the page, before any derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub url: String,
    pub title: String,
    pub price_text: String,
    pub vat_price_text: Option<String>,
    pub financing_text: Option<String>,
    pub location: String,
    pub description: String,
    /// Spec rows in page order.
    pub specifications: Vec<(String, String)>,
    pub tags: Vec<String>,
    pub seller: RawSeller,
    pub publication_date: String,
    pub image_urls: Vec<String>,
}

pub fn extract_listing(url: &str, html: &str) -> RawListing {
    let document = Html::parse_document(html);

    let title = first_match(&document, TITLE).unwrap_or_else(|| {
        warn!(url, field = "title", "no selector matched; using sentinel");
        UNKNOWN_TITLE.to_string()
    });
    let price_text = first_match(&document, PRICE).unwrap_or_else(|| {
        warn!(url, field = "price", "no selector matched; using sentinel");
        UNKNOWN_PRICE.to_string()
    });
    let location = first_match(&document, LOCATION).unwrap_or_else(|| {
        warn!(url, field = "location", "no selector matched; using sentinel");
        UNKNOWN_LOCATION.to_string()
    });
    let description = first_match(&document, DESCRIPTION).unwrap_or_else(|| {
        debug!(url, field = "description", "no description found");
        String::new()
    });
    let publication_date =
        first_match(&document, PUBLICATION_DATE).unwrap_or_else(|| UNKNOWN_DATE.to_string());

    let raw = RawListing {
        url: url.to_string(),
        title,
        price_text,
        vat_price_text: first_match(&document, VAT_PRICE),
        financing_text: first_match(&document, FINANCING),
        location,
        description,
        specifications: extract_specifications(&document),
        tags: extract_tags(&document),
        seller: extract_seller(&document),
        publication_date,
        image_urls: extract_image_urls(&document),
    };
    debug!(
        url,
        specs = raw.specifications.len(),
        images = raw.image_urls.len(),
        tags = raw.tags.len(),
        "listing fields extracted"
    );
    raw
}

/// Definition-list pairs from the first container that has any; the
/// key/value row layout is only consulted when none do.
pub fn extract_specifications(document: &Html) -> Vec<(String, String)> {
    for container in SPEC_CONTAINERS {
        let pairs = definition_pairs(document, container);
        if !pairs.is_empty() {
            return pairs;
        }
    }

    select(document, KEY_VALUE_ROWS)
        .into_iter()
        .filter_map(|row| {
            let key = select_within(row, KEY_VALUE_KEYS).into_iter().next().map(element_text)?;
            let value = select_within(row, KEY_VALUE_VALUES).into_iter().next().map(element_text)?;
            (!key.is_empty() && !value.is_empty()).then_some((key, value))
        })
        .collect()
}

fn definition_pairs(document: &Html, container: &str) -> Vec<(String, String)> {
    let selector = format!("{container} dt, {container} dd");
    let mut pairs = Vec::new();
    let mut pending_key: Option<String> = None;
    for element in select(document, &selector) {
        let text = element_text(element);
        match element.value().name() {
            "dt" => pending_key = Some(text),
            "dd" => {
                if let Some(key) = pending_key.take() {
                    if !key.is_empty() && !text.is_empty() {
                        pairs.push((key, text));
                    }
                }
            }
            _ => {}
        }
    }
    pairs
}

pub fn extract_tags(document: &Html) -> Vec<String> {
    for selector in TAG_SELECTORS {
        let elements = select(document, selector);
        if !elements.is_empty() {
            return elements
                .into_iter()
                .map(element_text)
                .filter(|tag| !tag.is_empty())
                .collect();
        }
    }
    Vec::new()
}

pub fn extract_seller(document: &Html) -> RawSeller {
    let Some(container) = SELLER_SELECTORS
        .iter()
        .find_map(|selector| select(document, selector).into_iter().next())
    else {
        return RawSeller::default();
    };

    let first_text = |selector: &str| {
        select_within(container, selector)
            .into_iter()
            .map(element_text)
            .find(|text| !text.is_empty())
    };
    let info = element_text(container);
    RawSeller {
        info: (!info.is_empty()).then_some(info),
        name: first_text(".name, .seller-name"),
        type_text: first_text(".type, .seller-type"),
    }
}

/// Absolute `src` values of the first image selector that has any, in page
/// order, without repeats.
pub fn extract_image_urls(document: &Html) -> Vec<String> {
    for selector in IMAGE_SELECTORS {
        let mut urls: Vec<String> = Vec::new();
        for element in select(document, selector) {
            let Some(src) = element.value().attr("src").map(str::trim) else {
                continue;
            };
            if (src.starts_with("http://") || src.starts_with("https://"))
                && !urls.iter().any(|u| u == src)
            {
                urls.push(src.to_string());
            }
        }
        if !urls.is_empty() {
            return urls;
        }
    }
    Vec::new()
}
