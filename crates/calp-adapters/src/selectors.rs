//! Typed selector-fallback chains over a parsed document.
//!
//! A field is described by an ordered slice of [`Strategy`] values. Each
//! strategy is a pure lookup against the document; [`first_match`] returns
//! the first one that yields non-empty text. An invalid CSS selector makes
//! its strategy yield nothing instead of failing the field.

use scraper::{ElementRef, Html, Selector};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Collapsed text of the first matching element with any text.
    Text(&'static str),
    /// Attribute value of the first matching element that carries it.
    Attr(&'static str, &'static str),
    /// Text of the first matching element whose own text nodes contain
    /// `needle` (case-sensitive).
    TextContaining {
        selector: &'static str,
        needle: &'static str,
    },
}

impl Strategy {
    pub fn apply(&self, document: &Html) -> Option<String> {
        match *self {
            Strategy::Text(selector) => select(document, selector)
                .into_iter()
                .find_map(|el| non_empty(element_text(el))),
            Strategy::Attr(selector, attr) => select(document, selector)
                .into_iter()
                .find_map(|el| el.value().attr(attr).and_then(|v| non_empty(v.trim().to_string()))),
            Strategy::TextContaining { selector, needle } => select(document, selector)
                .into_iter()
                .filter(|el| own_text(*el).contains(needle))
                .find_map(|el| non_empty(element_text(el))),
        }
    }
}

pub fn first_match(document: &Html, chain: &[Strategy]) -> Option<String> {
    chain.iter().find_map(|strategy| strategy.apply(document))
}

pub fn parse_selector(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(selector, error = %err, "invalid css selector skipped");
            None
        }
    }
}

/// All elements matching `selector`, in document order.
pub fn select<'a>(document: &'a Html, selector: &str) -> Vec<ElementRef<'a>> {
    match parse_selector(selector) {
        Some(parsed) => document.select(&parsed).collect(),
        None => Vec::new(),
    }
}

pub fn select_within<'a>(element: ElementRef<'a>, selector: &str) -> Vec<ElementRef<'a>> {
    match parse_selector(selector) {
        Some(parsed) => element.select(&parsed).collect(),
        None => Vec::new(),
    }
}

/// Descendant text with whitespace runs collapsed to single spaces.
pub fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "))
}

fn own_text(element: ElementRef<'_>) -> String {
    element
        .children()
        .filter_map(|child| child.value().as_text().map(|t| String::from(&**t)))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
