use std::path::PathBuf;

use calp_adapters::{
    discover_listing_urls, discover_static, parse_listing_page, BrowserSession, StaticSession,
    DEFAULT_LISTING_MARKER,
};
use calp_core::{PriceRange, SellerType};
use chrono::{TimeZone, Utc};

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/blocket")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn search_results_yield_two_unique_listing_urls() {
    let urls = discover_static(&fixture("search_results.html"), DEFAULT_LISTING_MARKER);
    assert_eq!(
        urls,
        vec![
            "https://www.blocket.se/annons/stockholm/porsche_911_carrera_s/111",
            "https://www.blocket.se/annons/goteborg/porsche_cayenne_e_hybrid/222",
        ]
    );
}

#[tokio::test]
async fn live_anchors_are_used_only_when_static_parse_is_empty() {
    let mut session = StaticSession::new().with_live_hrefs(vec![
        "https://www.blocket.se/annons/333".into(),
        "https://www.blocket.se/annons/333".into(),
        "https://www.blocket.se/om".into(),
    ]);

    let urls = discover_listing_urls(&mut session, "<html><body>laddar...</body></html>", DEFAULT_LISTING_MARKER).await;
    assert_eq!(urls, vec!["https://www.blocket.se/annons/333"]);

    let urls = discover_listing_urls(&mut session, &fixture("search_results.html"), DEFAULT_LISTING_MARKER).await;
    assert_eq!(urls.len(), 2);
}

#[tokio::test]
async fn relative_result_links_resolve_through_the_live_dom() {
    let search = "https://www.blocket.se/annonser/hela_sverige/fordon/bilar?q=porsche";
    let html = fixture("search_results_relative.html");
    assert!(discover_static(&html, DEFAULT_LISTING_MARKER).is_empty());

    let mut session = StaticSession::new().with_page(search, html.clone());
    session.navigate(search).await.unwrap();
    let urls = discover_listing_urls(&mut session, &html, DEFAULT_LISTING_MARKER).await;
    assert_eq!(
        urls,
        vec![
            "https://www.blocket.se/annons/uppsala/porsche_718_cayman/333",
            "https://www.blocket.se/annons/malmo/porsche_taycan_4s/444",
        ]
    );
}

#[test]
fn detail_page_is_extracted_and_normalized() {
    let url = "https://www.blocket.se/annons/stockholm/porsche_911_carrera_s/111";
    let scraped_at = Utc.with_ymd_and_hms(2026, 3, 1, 5, 0, 0).single().unwrap();
    let listing = parse_listing_page(url, &fixture("listing_detail.html"), scraped_at);

    assert_eq!(listing.id, "111");
    assert_eq!(listing.title, "Porsche 911 Carrera S PDK Sport Chrono");
    assert_eq!(listing.price.amount(), Some(1_195_000));
    assert_eq!(listing.price_range(), Some(PriceRange::Over1m));
    assert_eq!(listing.vat_price, Some(956_000));
    assert_eq!(listing.financing_monthly, Some(12_450));
    assert_eq!(listing.city.as_deref(), Some("Stockholm"));
    assert_eq!(listing.region.as_deref(), Some("Södermalm"));
    assert_eq!(listing.year, Some(2019));
    assert_eq!(listing.mileage, Some(3450));
    assert_eq!(listing.fuel_type.as_deref(), Some("Bensin"));
    assert_eq!(listing.transmission.as_deref(), Some("Automat"));
    assert_eq!(listing.color.as_deref(), Some("Grå"));
    assert_eq!(listing.engine, None);
    assert_eq!(listing.make.as_deref(), Some("Porsche"));
    assert_eq!(listing.model.as_deref(), Some("911"));
    assert_eq!(listing.specifications.len(), 6);
    assert_eq!(listing.normalized_specs.get("modellår").map(String::as_str), Some("2019"));
    assert_eq!(listing.tags, vec!["Turbo", "Sport Chrono"]);
    assert_eq!(listing.seller.name.as_deref(), Some("Sportbilar Stockholm AB"));
    assert_eq!(listing.seller.kind, Some(SellerType::Dealer));
    assert_eq!(
        listing.publication_timestamp,
        Some(Utc.with_ymd_and_hms(2026, 2, 14, 0, 0, 0).single().unwrap().timestamp())
    );

    let image_urls: Vec<_> = listing.images.iter().map(|i| i.url.as_str()).collect();
    assert_eq!(
        image_urls,
        vec!["https://images.blocket.se/111/1.jpg", "https://images.blocket.se/111/2.jpg"]
    );
    assert_eq!(listing.images[1].local_path, "images/111/111_2.jpg");

    for keyword in ["porsche", "911", "2019", "bensin", "automat", "grå", "dealer", "turbo", "sport chrono"] {
        assert!(listing.keywords.contains(keyword), "missing keyword {keyword}");
    }
    assert_eq!(listing.keywords.len(), 9);
    assert!(listing.search_text.starts_with("Porsche 911 Carrera S PDK Sport Chrono 1 195 000 kr Stockholm, Södermalm"));
    assert!(listing.search_text.contains("Miltal 3 450 mil"));
    assert!(!listing.indexed);
    assert!(listing.active);
}
