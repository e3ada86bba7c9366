#![allow(dead_code)]

use serde_json::json;
use shortstack::{BackendKind, Record, Shortstack, StoreConfig, Tenant};
use std::path::Path;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub const ALL_BACKENDS: [BackendKind; 4] = [
    BackendKind::Memory,
    BackendKind::Table,
    BackendKind::Sqlite,
    BackendKind::Index,
];

/// Routes library logs to the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config(dir: &Path, backend: BackendKind) -> StoreConfig {
    let mut config = StoreConfig::default()
        .with_backend(backend)
        .with_data_dir(dir);
    config.retry_base_delay_ms = 5;
    config.reindex_batch_size = 4;
    config
}

/// Opens a store in a fresh temp dir and provisions `tenants`.
pub async fn open_with_tenants(backend: BackendKind, tenants: &[&str]) -> (Shortstack, TempDir) {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let app = Shortstack::open(test_config(tmp.path(), backend)).unwrap();
    for tenant in tenants {
        app.create_tenant(&Tenant::new(*tenant)).await.unwrap();
    }
    (app, tmp)
}

pub fn car(name: &str) -> Record {
    Record::new("car")
        .with_name(name)
        .with_tags(["fast", "red"])
        .with_property("make", json!("Saab"))
        .with_property("year", json!(1998))
}

pub fn numbered(kind: &str, n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            Record::new(kind)
                .with_name(format!("item {}", i))
                .with_property("n", json!(i))
        })
        .collect()
}
