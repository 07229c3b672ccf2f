//! Listing persistence: upsert idempotence, image-set diffing, uniqueness,
//! filtered queries, and the suspicion lifecycle.

use adscout::source::{ListingDetail, ListingStatus, ListingSummary, PriceInfo};
use adscout::store::{Database, ListingFilter, ListingStore};
use serde_json::json;
use std::collections::BTreeMap;

fn summary(external_id: &str) -> ListingSummary {
    ListingSummary {
        external_id: external_id.to_string(),
        url: format!("https://www.kleinanzeigen.de/s-anzeige/{external_id}"),
        title: "Woom 3 Kinderfahrrad".to_string(),
        price_text: "150".to_string(),
        description: "Gut erhaltenes Rad".to_string(),
        image_url: Some("https://img.example.de/thumb.jpg".to_string()),
    }
}

fn detail(external_id: &str, images: &[&str]) -> ListingDetail {
    ListingDetail {
        external_id: external_id.to_string(),
        categories: vec!["Familie, Kind & Baby".to_string(), "Kinderfahrräder".to_string()],
        title: "Woom 3 Kinderfahrrad".to_string(),
        status: ListingStatus::Active,
        price: PriceInfo {
            amount: Some("150".to_string()),
            currency: Some("€".to_string()),
            negotiable: Some(true),
            raw: Some("150 € VB".to_string()),
        },
        delivery: None,
        description: Some("Gut erhaltenes Rad".to_string()),
        images: images.iter().map(|s| s.to_string()).collect(),
        location: None,
        seller: None,
        details: BTreeMap::new(),
        features: vec![],
        extra_info: json!({ "created_at": "15.01.24, 13:45", "views": "42" }),
    }
}

#[tokio::test]
async fn upsert_is_idempotent() {
    let db = Database::connect_in_memory().await.unwrap();
    let mut conn = db.pool().acquire().await.unwrap();

    let s = summary("100001");
    let d = detail("100001", &["https://img.example.de/1.jpg"]);

    let first = ListingStore::upsert(&mut conn, &s, Some(&d), Some("woom"), None)
        .await
        .unwrap();
    assert!(first.was_created);
    assert!(first.images_changed);
    assert_eq!(first.listing.query_name.as_deref(), Some("woom"));
    assert_eq!(first.listing.price_amount.as_deref(), Some("150"));

    let second = ListingStore::upsert(&mut conn, &s, Some(&d), Some("woom"), None)
        .await
        .unwrap();
    assert!(!second.was_created);
    assert!(!second.images_changed);
    assert_eq!(first.listing.id, second.listing.id);
    assert_eq!(first.listing.first_seen_at, second.listing.first_seen_at);
    assert!(second.listing.last_seen_at >= first.listing.last_seen_at);

    let (rows, total) = ListingStore::list(
        &mut conn,
        &ListingFilter {
            limit: 10,
            offset: 0,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn images_changed_tracks_set_equality_not_order() {
    let db = Database::connect_in_memory().await.unwrap();
    let mut conn = db.pool().acquire().await.unwrap();

    let s = summary("100002");
    ListingStore::upsert(
        &mut conn,
        &s,
        Some(&detail("100002", &["a.jpg", "b.jpg"])),
        None,
        None,
    )
    .await
    .unwrap();

    // Same set, different order: not a change.
    let reordered = ListingStore::upsert(
        &mut conn,
        &s,
        Some(&detail("100002", &["b.jpg", "a.jpg"])),
        None,
        None,
    )
    .await
    .unwrap();
    assert!(!reordered.images_changed);

    // Different set: a change.
    let swapped = ListingStore::upsert(
        &mut conn,
        &s,
        Some(&detail("100002", &["a.jpg", "c.jpg"])),
        None,
        None,
    )
    .await
    .unwrap();
    assert!(swapped.images_changed);
    assert_eq!(swapped.listing.image_urls, vec!["a.jpg", "c.jpg"]);
}

#[tokio::test]
async fn external_id_stays_unique_across_upserts() {
    let db = Database::connect_in_memory().await.unwrap();
    let mut conn = db.pool().acquire().await.unwrap();

    for _ in 0..3 {
        ListingStore::upsert(&mut conn, &summary("100003"), None, None, None)
            .await
            .unwrap();
    }
    let (_, total) = ListingStore::list(
        &mut conn,
        &ListingFilter {
            limit: 10,
            offset: 0,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn posted_at_is_parsed_from_the_creation_phrase() {
    let db = Database::connect_in_memory().await.unwrap();
    let mut conn = db.pool().acquire().await.unwrap();

    let outcome = ListingStore::upsert(
        &mut conn,
        &summary("100004"),
        Some(&detail("100004", &["a.jpg"])),
        None,
        None,
    )
    .await
    .unwrap();
    let posted = outcome.listing.posted_at.expect("date phrase should parse");
    assert_eq!(posted.to_rfc3339(), "2024-01-15T12:45:00+00:00");
    assert_eq!(outcome.listing.posted_at_text.as_deref(), Some("15.01.24, 13:45"));

    // An unparseable phrase keeps only the raw text.
    let mut vague = detail("100005", &["a.jpg"]);
    vague.extra_info = json!({ "created_at": "Vor 2 Stunden" });
    let outcome = ListingStore::upsert(&mut conn, &summary("100005"), Some(&vague), None, None)
        .await
        .unwrap();
    assert!(outcome.listing.posted_at.is_none());
    assert_eq!(outcome.listing.posted_at_text.as_deref(), Some("Vor 2 Stunden"));
}

#[tokio::test]
async fn list_filters_by_status_and_search_term() {
    let db = Database::connect_in_memory().await.unwrap();
    let mut conn = db.pool().acquire().await.unwrap();

    let mut sold = detail("100006", &[]);
    sold.status = ListingStatus::Sold;
    sold.title = "Puky Laufrad".to_string();
    ListingStore::upsert(&mut conn, &summary("100006"), Some(&sold), Some("puky"), None)
        .await
        .unwrap();
    ListingStore::upsert(
        &mut conn,
        &summary("100007"),
        Some(&detail("100007", &[])),
        Some("woom"),
        None,
    )
    .await
    .unwrap();

    let (rows, total) = ListingStore::list(
        &mut conn,
        &ListingFilter {
            limit: 10,
            offset: 0,
            status: Some("sold".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].external_id, "100006");

    // Case-insensitive substring over title and description.
    let (rows, total) = ListingStore::list(
        &mut conn,
        &ListingFilter {
            limit: 10,
            offset: 0,
            search_term: Some("LAUFRAD".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].external_id, "100006");

    let (_, total) = ListingStore::list(
        &mut conn,
        &ListingFilter {
            limit: 10,
            offset: 0,
            query_name: Some("woom".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn suspicion_lifecycle_bumps_last_analyzed_at() {
    let db = Database::connect_in_memory().await.unwrap();
    let mut conn = db.pool().acquire().await.unwrap();

    let outcome = ListingStore::upsert(&mut conn, &summary("100008"), None, None, None)
        .await
        .unwrap();
    let id = outcome.listing.id;

    let meta = json!({ "matches": [{ "external_id": "x" }] });
    ListingStore::mark_suspicion(&mut conn, id, "duplicate-image", Some(0.969), Some(&meta))
        .await
        .unwrap();
    let marked = ListingStore::get_by_id(&mut conn, id).await.unwrap().unwrap();
    assert!(marked.is_suspicious);
    assert_eq!(marked.suspicion_reason.as_deref(), Some("duplicate-image"));
    assert_eq!(marked.suspicion_confidence, Some(0.969));
    let first_analyzed = marked.last_analyzed_at.expect("analyzed timestamp set");

    ListingStore::clear_suspicion(&mut conn, id).await.unwrap();
    let cleared = ListingStore::get_by_id(&mut conn, id).await.unwrap().unwrap();
    assert!(!cleared.is_suspicious);
    assert!(cleared.suspicion_reason.is_none());
    assert!(cleared.suspicion_meta.is_none());
    assert!(cleared.last_analyzed_at.expect("bumped") >= first_analyzed);
}
