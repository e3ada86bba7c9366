mod common;

use common::test_config;
use indexmap::IndexMap;
use serde_json::{json, Value};
use shortstack::search::SearchEngine;
use shortstack::{BackendKind, ObjectStore, Pager, Record, Shortstack, TantivySearch, Tenant};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

fn engine(tmp: &TempDir) -> TantivySearch {
    TantivySearch::open(Arc::new(test_config(tmp.path(), BackendKind::Memory))).unwrap()
}

#[allow(clippy::too_many_arguments)]
fn vehicle(id: &str, kind: &str, name: &str, make: &str, year: i64, price: i64, tags: &[&str], ts: i64) -> Record {
    let mut record = Record::new(kind)
        .with_id(id)
        .with_name(name)
        .with_tags(tags.iter().copied())
        .with_property("make", json!(make))
        .with_property("year", json!(year))
        .with_property("price", json!(price));
    record.timestamp = Some(ts);
    record
}

async fn garage(tenant: &str) -> (TantivySearch, TempDir) {
    let tmp = TempDir::new().unwrap();
    let search = engine(&tmp);
    let records = vec![
        vehicle("c1", "car", "Red Sedan", "Saab", 1998, 12000, &["fast", "red"], 1000),
        vehicle("c2", "car", "Blue Coupe", "Volvo", 2005, 25000, &["blue"], 2000),
        vehicle("c3", "car", "Green Sedan", "Saab", 2012, 31000, &["fast", "green"], 3000),
        vehicle("b1", "bike", "Red Racer", "Trek", 2020, 900, &["red", "fast"], 4000),
    ];
    search.index_all(tenant, &records).await.unwrap();
    (search, tmp)
}

fn ids(records: &[Record]) -> Vec<&str> {
    records.iter().map(|r| r.id.as_str()).collect()
}

fn id_set(records: &[Record]) -> HashSet<&str> {
    records.iter().map(|r| r.id.as_str()).collect()
}

fn terms(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

// ============================================================
// LOOKUPS
// ============================================================

#[tokio::test]
async fn test_find_by_id_and_ids() {
    let (search, _tmp) = garage("acme").await;

    let c2 = search.find_by_id("acme", "c2").await.unwrap();
    assert_eq!(c2.name.as_deref(), Some("Blue Coupe"));
    assert_eq!(c2.appid, "acme");
    assert_eq!(c2.property("year"), Some(&json!(2005)));
    assert!(search.find_by_id("acme", "nope").await.is_none());
    assert!(search.find_by_id("other", "c2").await.is_none());

    let wanted = vec!["c3".to_string(), "nope".to_string(), "c1".to_string()];
    let found = search.find_by_ids("acme", &wanted).await;
    assert_eq!(ids(&found), vec!["c3", "c1"]);
}

#[tokio::test]
async fn test_unknown_tenant_finds_nothing() {
    let (search, _tmp) = garage("acme").await;
    let mut pager = Pager::new(10);
    assert!(search.find_query("ghost", None, "*", &mut pager).await.is_empty());
    assert_eq!(pager.count, 0);
    assert_eq!(search.count("ghost", None).await, 0);
    assert_eq!(search.count("", None).await, 0);
}

#[tokio::test]
async fn test_reindexing_replaces_document() {
    let (search, _tmp) = garage("acme").await;
    let updated = vehicle("c2", "car", "Blue Wagon", "Volvo", 2006, 26000, &["blue"], 2000);
    search.index("acme", &updated).await.unwrap();

    assert_eq!(search.count("acme", Some("car")).await, 3);
    let c2 = search.find_by_id("acme", "c2").await.unwrap();
    assert_eq!(c2.name.as_deref(), Some("Blue Wagon"));

    search.unindex("acme", &updated).await.unwrap();
    assert!(search.find_by_id("acme", "c2").await.is_none());
    assert_eq!(search.count("acme", None).await, 3);
}

// ============================================================
// TERMS AND RANGES
// ============================================================

#[tokio::test]
async fn test_find_terms_equality() {
    let (search, _tmp) = garage("acme").await;

    let mut pager = Pager::new(10);
    let saabs = search
        .find_terms("acme", Some("car"), &terms(&[("make", json!("Saab"))]), true, &mut pager)
        .await;
    assert_eq!(ids(&saabs), vec!["c3", "c1"], "newest first by default");
    assert_eq!(pager.count, 2);

    let mut pager = Pager::new(10);
    let either = search
        .find_terms(
            "acme",
            None,
            &terms(&[("make", json!("Volvo")), ("year", json!(2020))]),
            false,
            &mut pager,
        )
        .await;
    assert_eq!(id_set(&either), HashSet::from(["c2", "b1"]));

    let mut pager = Pager::new(10);
    let both = search
        .find_terms(
            "acme",
            None,
            &terms(&[("make", json!("Saab")), ("tags", json!("green"))]),
            true,
            &mut pager,
        )
        .await;
    assert_eq!(ids(&both), vec!["c3"]);

    let mut pager = Pager::new(10);
    assert!(search
        .find_terms("acme", None, &IndexMap::new(), true, &mut pager)
        .await
        .is_empty());
    assert_eq!(pager.count, 0);
}

#[tokio::test]
async fn test_find_terms_ranges() {
    let (search, _tmp) = garage("acme").await;

    let mut pager = Pager::new(10);
    let recent = search
        .find_terms("acme", Some("car"), &terms(&[("year>=", json!(2005))]), true, &mut pager)
        .await;
    assert_eq!(id_set(&recent), HashSet::from(["c2", "c3"]));

    let mut pager = Pager::new(10);
    let cheap = search
        .find_terms("acme", None, &terms(&[("price<", json!(25000))]), true, &mut pager)
        .await;
    assert_eq!(id_set(&cheap), HashSet::from(["c1", "b1"]));

    let mut pager = Pager::new(10);
    let window = search
        .find_terms(
            "acme",
            None,
            &terms(&[("year>", json!(2005)), ("year<=", json!(2012))]),
            true,
            &mut pager,
        )
        .await;
    assert_eq!(ids(&window), vec!["c3"]);

    assert_eq!(
        search
            .count_terms("acme", Some("car"), &terms(&[("price>", json!(12000))]))
            .await,
        2
    );
}

#[tokio::test]
async fn test_sort_order() {
    let (search, _tmp) = garage("acme").await;

    let mut pager = Pager::new(10).sorted_by("timestamp", false);
    let oldest_first = search.find_query("acme", Some("car"), "*", &mut pager).await;
    assert_eq!(ids(&oldest_first), vec!["c1", "c2", "c3"]);

    let mut pager = Pager::new(10).sorted_by("no_such_field", true);
    let fallback = search.find_query("acme", Some("car"), "*", &mut pager).await;
    assert_eq!(ids(&fallback), vec!["c3", "c2", "c1"]);

    let mut pager = Pager::new(10).sorted_by("_score", true);
    let by_score = search.find_query("acme", None, "sedan", &mut pager).await;
    assert_eq!(id_set(&by_score), HashSet::from(["c1", "c3"]));
}

#[tokio::test]
async fn test_paging_through_results() {
    let (search, _tmp) = garage("acme").await;

    let mut seen = Vec::new();
    for page in 1..=3 {
        let mut pager = Pager::new(3).with_page(page);
        let hits = search.find_query("acme", None, "", &mut pager).await;
        assert_eq!(pager.count, 4);
        seen.extend(hits.into_iter().map(|r| r.id));
    }
    assert_eq!(seen, vec!["b1", "c3", "c2", "c1"]);
}

// ============================================================
// PATTERNS, LISTS, TAGS
// ============================================================

#[tokio::test]
async fn test_prefix_and_wildcard() {
    let (search, _tmp) = garage("acme").await;

    let mut pager = Pager::new(10);
    let red = search.find_prefix("acme", None, "name", "Red", &mut pager).await;
    assert_eq!(id_set(&red), HashSet::from(["c1", "b1"]));

    let mut pager = Pager::new(10);
    let saab = search.find_wildcard("acme", None, "make", "S?a*", &mut pager).await;
    assert_eq!(id_set(&saab), HashSet::from(["c1", "c3"]));

    let mut pager = Pager::new(10);
    let sedans = search.find_wildcard("acme", Some("car"), "name", "*Sedan", &mut pager).await;
    assert_eq!(pager.count, 2);
    assert_eq!(id_set(&sedans), HashSet::from(["c1", "c3"]));

    let mut pager = Pager::new(10);
    assert!(search.find_prefix("acme", None, "name", "", &mut pager).await.is_empty());
}

#[tokio::test]
async fn test_term_in_list() {
    let (search, _tmp) = garage("acme").await;

    let mut pager = Pager::new(10);
    let makes = search
        .find_term_in_list("acme", None, "make", &[json!("Volvo"), json!("Trek")], &mut pager)
        .await;
    assert_eq!(id_set(&makes), HashSet::from(["c2", "b1"]));

    let mut pager = Pager::new(10);
    let years = search
        .find_term_in_list("acme", Some("car"), "year", &[json!(1998), json!(2005), json!(2020)], &mut pager)
        .await;
    assert_eq!(id_set(&years), HashSet::from(["c1", "c2"]));

    let mut pager = Pager::new(10);
    assert!(search
        .find_term_in_list("acme", None, "make", &[], &mut pager)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_find_tagged_requires_all_tags() {
    let (search, _tmp) = garage("acme").await;

    let mut pager = Pager::new(10);
    let fast_red = search
        .find_tagged("acme", None, &["fast".to_string(), "red".to_string()], &mut pager)
        .await;
    assert_eq!(id_set(&fast_red), HashSet::from(["c1", "b1"]));

    let mut pager = Pager::new(10);
    let fast_cars = search
        .find_tagged("acme", Some("car"), &["fast".to_string()], &mut pager)
        .await;
    assert_eq!(id_set(&fast_cars), HashSet::from(["c1", "c3"]));

    let mut pager = Pager::new(10);
    assert!(search.find_tagged("acme", None, &[], &mut pager).await.is_empty());
}

// ============================================================
// FREE TEXT AND SIMILARITY
// ============================================================

#[tokio::test]
async fn test_free_text() {
    let (search, _tmp) = garage("acme").await;

    let mut pager = Pager::new(10);
    let sedans = search.find_query("acme", Some("car"), "sedan", &mut pager).await;
    assert_eq!(id_set(&sedans), HashSet::from(["c1", "c3"]));

    // Property text is searchable through the catch-all field.
    let mut pager = Pager::new(10);
    let trek = search.find_query("acme", None, "trek", &mut pager).await;
    assert_eq!(ids(&trek), vec!["b1"]);

    let mut pager = Pager::new(10);
    let tagged = search.find_query("acme", None, "green", &mut pager).await;
    assert_eq!(ids(&tagged), vec!["c3"]);
}

#[tokio::test]
async fn test_invalid_query_degrades_to_match_all() {
    let (search, _tmp) = garage("acme").await;
    let mut pager = Pager::new(10);
    let all = search
        .find_query("acme", None, "nosuchfield:whatever", &mut pager)
        .await;
    assert_eq!(all.len(), 4);
    assert_eq!(pager.count, 4);
}

#[tokio::test]
async fn test_find_similar() {
    let (search, _tmp) = garage("acme").await;

    let mut pager = Pager::new(10).sorted_by("_score", true);
    let like_c1 = search
        .find_similar("acme", None, "c1", &["name".to_string()], "Red Sedan", &mut pager)
        .await;
    assert_eq!(id_set(&like_c1), HashSet::from(["c3", "b1"]));

    let mut pager = Pager::new(10);
    let same_make = search
        .find_similar("acme", Some("car"), "c1", &["make".to_string()], "Saab", &mut pager)
        .await;
    assert_eq!(ids(&same_make), vec!["c3"]);

    let mut pager = Pager::new(10);
    assert!(search
        .find_similar("acme", None, "c1", &[], "", &mut pager)
        .await
        .is_empty());
}

// ============================================================
// TENANCY AND COUNTS
// ============================================================

#[tokio::test]
async fn test_counts() {
    let (search, _tmp) = garage("acme").await;
    assert_eq!(search.count("acme", None).await, 4);
    assert_eq!(search.count("acme", Some("car")).await, 3);
    assert_eq!(search.count("acme", Some("boat")).await, 0);
    assert_eq!(
        search
            .count_terms("acme", None, &terms(&[("make", json!("Saab"))]))
            .await,
        2
    );
    assert_eq!(search.count_terms("acme", None, &IndexMap::new()).await, 0);
}

#[tokio::test]
async fn test_shared_index_isolation() {
    let tmp = TempDir::new().unwrap();
    let search = engine(&tmp);
    let alpha = vehicle("same", "car", "Alpha Sedan", "Saab", 2001, 1, &[], 1);
    let beta = vehicle("same", "car", "Beta Sedan", "Volvo", 2002, 2, &[], 2);
    search.index(" alpha", &alpha).await.unwrap();
    search.index(" beta", &beta).await.unwrap();
    search
        .index(" beta", &vehicle("b2", "car", "Beta Coupe", "Volvo", 2003, 3, &[], 3))
        .await
        .unwrap();

    assert_eq!(search.count(" alpha", None).await, 1);
    assert_eq!(search.count(" beta", None).await, 2);
    assert_eq!(
        search.physical_name(" alpha"),
        search.physical_name(" beta"),
        "shared tenants use one index"
    );

    let a = search.find_by_id(" alpha", "same").await.unwrap();
    assert_eq!(a.name.as_deref(), Some("Alpha Sedan"));
    assert_eq!(a.appid, "alpha");

    let mut pager = Pager::new(10);
    let sedans = search.find_query(" beta", None, "sedan", &mut pager).await;
    assert_eq!(sedans.len(), 1);
    assert_eq!(sedans[0].name.as_deref(), Some("Beta Sedan"));

    search.unindex(" alpha", &alpha).await.unwrap();
    assert_eq!(search.count(" alpha", None).await, 0);
    assert_eq!(search.count(" beta", None).await, 2);
}

// ============================================================
// NEARBY
// ============================================================

fn place(id: &str, name: &str) -> Record {
    Record::new("store").with_id(id).with_name(name)
}

fn address(id: &str, parent: &str, latlng: &str) -> Record {
    Record::new("address")
        .with_id(id)
        .with_parent(parent)
        .with_property("latlng", json!(latlng))
}

#[tokio::test]
async fn test_find_nearby() {
    let tmp = TempDir::new().unwrap();
    let search = engine(&tmp);
    let records = vec![
        place("p1", "Downtown Deli"),
        place("p2", "Uptown Deli"),
        place("p3", "Faraway Deli"),
        address("a1", "p1", "42.6977,23.3219"),
        address("a2", "p2", "42.7100,23.3400"),
        address("a3", "p3", "41.9981,21.4254"),
        address("a4", "p1", "42.6980,23.3220"),
    ];
    search.index_all("acme", &records).await.unwrap();

    let mut pager = Pager::new(10);
    let close = search
        .find_nearby("acme", "store", "", 50.0, 42.6977, 23.3219, &mut pager)
        .await;
    assert_eq!(id_set(&close), HashSet::from(["p1", "p2"]));
    assert_eq!(pager.count, 2);

    let mut pager = Pager::new(10);
    let downtown = search
        .find_nearby("acme", "store", "downtown", 50.0, 42.6977, 23.3219, &mut pager)
        .await;
    assert_eq!(ids(&downtown), vec!["p1"]);

    let mut pager = Pager::new(10);
    let wide = search
        .find_nearby("acme", "store", "", 500.0, 42.6977, 23.3219, &mut pager)
        .await;
    assert_eq!(wide.len(), 3);

    for (radius, lat, kind) in [(0.0, 42.0, "store"), (50.0, 95.0, "store"), (50.0, 42.0, " ")] {
        let mut pager = Pager::new(10);
        assert!(search
            .find_nearby("acme", kind, "", radius, lat, 23.0, &mut pager)
            .await
            .is_empty());
    }
}

// ============================================================
// RECONCILIATION
// ============================================================

#[tokio::test]
async fn test_drift_is_skipped_when_reading_from_store() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path(), BackendKind::Memory);
    config.read_from_index = false;
    let app = Shortstack::open(config).unwrap();
    app.create_tenant(&Tenant::new("acme")).await.unwrap();

    let mut kept = Record::new("car").with_id("kept").with_name("Kept Sedan");
    let mut gone = Record::new("car").with_id("gone").with_name("Gone Sedan");
    app.put("acme", &mut kept).await.unwrap();
    app.put("acme", &mut gone).await.unwrap();

    // Store-only changes: one record disappears, the other is renamed.
    app.store().delete("acme", &gone).await.unwrap();
    let mut renamed = app.store().read("acme", "kept").await.unwrap().unwrap();
    renamed.name = Some("Renamed Sedan".into());
    app.store().update("acme", &mut renamed).await.unwrap();

    let mut pager = Pager::new(10);
    let hits = app.search().find_query("acme", None, "sedan", &mut pager).await;
    assert_eq!(ids(&hits), vec!["kept"]);
    assert_eq!(hits[0].name.as_deref(), Some("Renamed Sedan"));
    assert_eq!(pager.count, 1);

    assert!(app.search().find_by_id("acme", "gone").await.is_none());
    assert_eq!(app.search().count("acme", None).await, 2, "counts come from the index");
}
