mod common;

use common::{car, numbered, open_with_tenants, ALL_BACKENDS};
use serde_json::json;
use shortstack::{BackendKind, ObjectStore, Pager, Record, SearchEngine};
use std::collections::HashSet;

// ============================================================
// ROUND TRIP
// ============================================================

async fn round_trip(backend: BackendKind) {
    let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
    let store = app.store();

    let mut record = car("Red Sedan").with_parent("owner1");
    let id = store.create("acme", &mut record).await.unwrap().unwrap();
    assert_eq!(id, record.id);
    assert_eq!(record.appid, "acme");
    assert!(record.timestamp.is_some());

    let stored = store.read("acme", &id).await.unwrap().expect("record stored");
    assert_eq!(stored.id, id, "{}", backend);
    assert_eq!(stored.kind, "car");
    assert_eq!(stored.appid, "acme");
    assert_eq!(stored.name.as_deref(), Some("Red Sedan"));
    assert_eq!(stored.parentid.as_deref(), Some("owner1"));
    assert_eq!(stored.timestamp, record.timestamp);
    assert_eq!(stored.tags, vec!["fast", "red"]);
    assert_eq!(stored.property("make"), Some(&json!("Saab")));
    assert_eq!(stored.property("year"), Some(&json!(1998)));

    store.delete("acme", &stored).await.unwrap();
    assert!(store.read("acme", &id).await.unwrap().is_none(), "{}", backend);
}

#[tokio::test]
async fn test_round_trip_all_backends() {
    for backend in ALL_BACKENDS {
        round_trip(backend).await;
    }
}

#[tokio::test]
async fn test_caller_supplied_id_is_kept() {
    for backend in ALL_BACKENDS {
        let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
        let mut record = Record::new("car").with_id("vin-42");
        let id = app.store().create("acme", &mut record).await.unwrap();
        assert_eq!(id.as_deref(), Some("vin-42"), "{}", backend);
    }
}

#[tokio::test]
async fn test_blank_tenant_and_id_are_noops() {
    for backend in ALL_BACKENDS {
        let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
        let store = app.store();
        let mut record = car("x");
        assert_eq!(store.create("  ", &mut record).await.unwrap(), None, "{}", backend);
        assert!(store.read("acme", "").await.unwrap().is_none());
        assert!(store.read("", "abc").await.unwrap().is_none());

        let mut no_id = Record::new("car").with_name("ghost");
        store.update("acme", &mut no_id).await.unwrap();
        store.delete("acme", &no_id).await.unwrap();
        assert!(store.create_all("", &mut [car("y")]).await.unwrap().is_empty());
    }
}

// ============================================================
// BATCHES
// ============================================================

async fn chunked_create_and_read(backend: BackendKind, n: usize) {
    let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
    let store = app.store();

    let mut records = numbered("part", n);
    let ids = store.create_all("acme", &mut records).await.unwrap();
    assert_eq!(ids.len(), n, "{} n={}", backend, n);
    let expected: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, expected);

    let found = store.read_all("acme", &ids, true).await.unwrap();
    assert_eq!(found.len(), n);
    assert!(
        found.values().all(Option::is_some),
        "{} n={}: missing records after batch create",
        backend,
        n
    );
    let keys: Vec<String> = found.keys().cloned().collect();
    assert_eq!(keys, ids, "read_all keeps request order");

    // Writing the same batch again leaves the same set of records.
    let mut again = records.clone();
    store.update_all("acme", &mut again).await.unwrap();
    let mut pager = Pager::new(100);
    let mut seen = HashSet::new();
    loop {
        let page = store.read_page("acme", &mut pager).await.unwrap();
        if page.is_empty() {
            break;
        }
        seen.extend(page.into_iter().map(|r| r.id));
    }
    assert_eq!(seen.len(), n, "{} n={}", backend, n);

    store.delete_all("acme", &records).await.unwrap();
    let gone = store.read_all("acme", &ids, true).await.unwrap();
    assert!(gone.values().all(Option::is_none), "{} n={}", backend, n);
}

#[tokio::test]
async fn test_chunking_boundaries_all_backends() {
    for backend in ALL_BACKENDS {
        for n in [1, 25, 26, 51] {
            chunked_create_and_read(backend, n).await;
        }
    }
}

#[tokio::test]
async fn test_read_all_dedupes_and_fills_missing() {
    for backend in ALL_BACKENDS {
        let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
        let store = app.store();
        let mut a = car("a").with_id("a");
        let mut b = car("b").with_id("b");
        store.create("acme", &mut a).await.unwrap();
        store.create("acme", &mut b).await.unwrap();

        let ids: Vec<String> = ["b", "a", "b", "nope", "a", ""]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let found = store.read_all("acme", &ids, true).await.unwrap();
        let keys: Vec<&str> = found.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["b", "a", "nope"], "{}", backend);
        assert_eq!(found["a"].as_ref().unwrap().name.as_deref(), Some("a"));
        assert_eq!(found["b"].as_ref().unwrap().name.as_deref(), Some("b"));
        assert!(found["nope"].is_none());
    }
}

#[tokio::test]
async fn test_read_all_core_projection() {
    for backend in ALL_BACKENDS {
        let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
        let store = app.store();
        let mut a = car("a").with_id("a");
        store.create("acme", &mut a).await.unwrap();

        let found = store.read_all("acme", &["a".to_string()], false).await.unwrap();
        let record = found["a"].as_ref().expect("core attributes returned");
        assert_eq!(record.name.as_deref(), Some("a"), "{}", backend);
        assert_eq!(record.kind, "car");
        assert!(record.properties.is_empty(), "{}", backend);
    }
}

// ============================================================
// OPTIMISTIC LOCKING
// ============================================================

async fn lock_race(backend: BackendKind) {
    let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
    let store = app.store();
    let mut record = car("contested").with_version(1);
    let id = store.create("acme", &mut record).await.unwrap().unwrap();

    let mut first = store.read("acme", &id).await.unwrap().unwrap();
    let mut second = first.clone();
    assert_eq!(first.version, Some(1), "{}", backend);

    first.name = Some("first writer".into());
    store.update("acme", &mut first).await.unwrap();
    assert_eq!(first.version, Some(2), "{}", backend);

    second.name = Some("second writer".into());
    store.update("acme", &mut second).await.unwrap();
    assert_eq!(second.version, Some(-1), "{}", backend);
    assert!(second.is_conflicted());

    let stored = store.read("acme", &id).await.unwrap().unwrap();
    assert_eq!(stored.name.as_deref(), Some("first writer"), "{}", backend);
    assert_eq!(stored.version, Some(2));
}

#[tokio::test]
async fn test_optimistic_lock_race_all_backends() {
    for backend in ALL_BACKENDS {
        lock_race(backend).await;
    }
}

#[tokio::test]
async fn test_unlocked_update_overwrites() {
    for backend in ALL_BACKENDS {
        let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
        let store = app.store();
        let mut record = car("before");
        let id = store.create("acme", &mut record).await.unwrap().unwrap();
        let created_at = record.timestamp;

        let mut edit = store.read("acme", &id).await.unwrap().unwrap();
        edit.name = Some("after".into());
        edit.properties.insert("make".into(), json!("Volvo"));
        store.update("acme", &mut edit).await.unwrap();
        assert!(edit.version.is_none(), "{}", backend);
        assert!(edit.updated.is_some());

        let stored = store.read("acme", &id).await.unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("after"), "{}", backend);
        assert_eq!(stored.property("make"), Some(&json!("Volvo")));
        assert_eq!(stored.timestamp, created_at, "{}: creation time is protected", backend);
        assert!(stored.version.is_none() || stored.version == Some(0));
    }
}

async fn scan_ids(app: &shortstack::Shortstack, tenant: &str, limit: usize) -> Vec<String> {
    let mut pager = Pager::new(limit);
    let mut ids = Vec::new();
    loop {
        let page = app.store().read_page(tenant, &mut pager).await.unwrap();
        if page.is_empty() {
            break;
        }
        ids.extend(page.into_iter().map(|r| r.id));
    }
    ids
}

#[tokio::test]
async fn test_update_of_missing_record_creates_nothing() {
    for backend in ALL_BACKENDS {
        let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
        let store = app.store();
        let mut kept = car("kept");
        store.create("acme", &mut kept).await.unwrap();

        let mut ghost = Record::new("car").with_id("ghost").with_name("ghost");
        store.update("acme", &mut ghost).await.unwrap();
        let mut more = vec![Record::new("car").with_id("ghost-2").with_name("ghost")];
        store.update_all("acme", &mut more).await.unwrap();

        assert!(store.read("acme", "ghost").await.unwrap().is_none(), "{}", backend);
        assert!(store.read("acme", "ghost-2").await.unwrap().is_none(), "{}", backend);
        assert_eq!(scan_ids(&app, "acme", 10).await, vec![kept.id.clone()], "{}", backend);

        let report = app.reindex("acme").await.unwrap();
        assert_eq!(report.copied, 1, "{}", backend);
        assert!(app.search().find_by_id("acme", "ghost").await.is_none());
    }
}

#[tokio::test]
async fn test_update_all_keeps_protected_attributes() {
    for backend in ALL_BACKENDS {
        let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
        let store = app.store();
        let mut records = vec![
            car("first").with_creator("alice"),
            car("second").with_creator("alice"),
        ];
        store.create_all("acme", &mut records).await.unwrap();

        let mut edits: Vec<Record> = records
            .iter()
            .cloned()
            .map(|mut r| {
                r.kind = "truck".into();
                r.timestamp = Some(1);
                r.creatorid = Some("mallory".into());
                r.name = r.name.map(|n| format!("{} edited", n));
                r
            })
            .collect();
        store.update_all("acme", &mut edits).await.unwrap();

        for original in &records {
            let stored = store.read("acme", &original.id).await.unwrap().unwrap();
            assert_eq!(stored.kind, "car", "{}", backend);
            assert_eq!(stored.timestamp, original.timestamp, "{}", backend);
            assert_eq!(stored.creatorid.as_deref(), Some("alice"), "{}", backend);
            assert_eq!(stored.appid, "acme", "{}", backend);
            let expected = format!("{} edited", original.name.as_deref().unwrap());
            assert_eq!(stored.name.as_deref(), Some(expected.as_str()), "{}", backend);
        }
    }
}

// ============================================================
// TENANCY
// ============================================================

async fn shared_isolation(backend: BackendKind) {
    let (app, _tmp) = open_with_tenants(backend, &[" alpha", " beta", "solo"]).await;
    let store = app.store();

    let mut a = car("alpha car").with_id("same");
    let mut b = car("beta car").with_id("same");
    store.create(" alpha", &mut a).await.unwrap();
    store.create(" beta", &mut b).await.unwrap();
    let mut only_alpha = car("alpha only").with_id("alpha-only");
    store.create(" alpha", &mut only_alpha).await.unwrap();
    let mut solo = car("solo car").with_id("same");
    store.create("solo", &mut solo).await.unwrap();

    assert_eq!(a.appid, "alpha", "{}", backend);
    let read_a = store.read(" alpha", "same").await.unwrap().unwrap();
    let read_b = store.read(" beta", "same").await.unwrap().unwrap();
    assert_eq!(read_a.name.as_deref(), Some("alpha car"), "{}", backend);
    assert_eq!(read_b.name.as_deref(), Some("beta car"), "{}", backend);
    assert_eq!(read_b.appid, "beta");
    assert!(store.read(" beta", "alpha-only").await.unwrap().is_none(), "{}", backend);

    let mut pager = Pager::new(10);
    let mut beta_ids = Vec::new();
    loop {
        let page = store.read_page(" beta", &mut pager).await.unwrap();
        if page.is_empty() {
            break;
        }
        assert!(page.iter().all(|r| r.appid == "beta"), "{}", backend);
        beta_ids.extend(page.into_iter().map(|r| r.id));
    }
    assert_eq!(beta_ids, vec!["same".to_string()], "{}", backend);

    let solo_read = store.read("solo", "same").await.unwrap().unwrap();
    assert_eq!(solo_read.name.as_deref(), Some("solo car"));
}

#[tokio::test]
async fn test_shared_tenant_isolation_all_backends() {
    for backend in ALL_BACKENDS {
        shared_isolation(backend).await;
    }
}

// ============================================================
// PAGINATION
// ============================================================

#[tokio::test]
async fn test_pagination_terminates() {
    for backend in ALL_BACKENDS {
        let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
        let store = app.store();
        let mut records = numbered("part", 7);
        store.create_all("acme", &mut records).await.unwrap();

        let mut pager = Pager::new(3);
        let mut pages = 0;
        let mut seen = HashSet::new();
        loop {
            let page = store.read_page("acme", &mut pager).await.unwrap();
            if page.is_empty() {
                break;
            }
            pages += 1;
            assert!(page.len() <= 3, "{}", backend);
            for record in page {
                assert!(seen.insert(record.id.clone()), "{}: {} served twice", backend, record.id);
            }
            assert!(pages <= 3, "{}: scan did not terminate", backend);
        }
        assert_eq!(seen.len(), 7, "{}", backend);
        assert_eq!(pager.count, 7, "{}", backend);
    }
}

#[tokio::test]
async fn test_pagination_with_tied_timestamps() {
    for backend in ALL_BACKENDS {
        for tenant in ["acme", " beta"] {
            let (app, _tmp) = open_with_tenants(backend, &["acme", " beta"]).await;
            let mut records = numbered("part", 9);
            for record in records.iter_mut() {
                record.timestamp = Some(1_000);
            }
            app.store().create_all(tenant, &mut records).await.unwrap();

            let ids = scan_ids(&app, tenant, 2).await;
            let unique: HashSet<&String> = ids.iter().collect();
            assert_eq!(unique.len(), ids.len(), "{} {:?}: duplicates across pages", backend, tenant);
            let expected: HashSet<&String> = records.iter().map(|r| &r.id).collect();
            assert_eq!(unique, expected, "{} {:?}", backend, tenant);
        }
    }
}

#[tokio::test]
async fn test_empty_tenant_scan() {
    for backend in ALL_BACKENDS {
        let (app, _tmp) = open_with_tenants(backend, &["acme"]).await;
        let mut pager = Pager::new(10);
        let page = app.store().read_page("acme", &mut pager).await.unwrap();
        assert!(page.is_empty(), "{}", backend);
        assert_eq!(pager.count, 0);
        assert_eq!(pager.page, 1);
    }
}
