//! In-process adapter. Rows are codec-encoded and kept per storage unit in
//! key order, with the same dedicated/shared layout as the table backend.
//!
//! Consistency: every write is visible to the next read. A conditional update
//! checks and writes under the unit's shard lock, so it is atomic.

use crate::config::StoreConfig;
use crate::error::Result;
use crate::lifecycle::{BackgroundJob, TenantListener};
use crate::store::codec::{self, Row, KEY_ATTR, LOCKED_ON_UPDATE};
use crate::store::{blank, dedupe_ids, ObjectStore};
use crate::tenancy::{Route, TenancyRouter};
use crate::types::{now_millis, Pager, Record, Tenant, VERSION_CONFLICT};
use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

pub struct MemoryStore {
    config: Arc<StoreConfig>,
    router: TenancyRouter,
    units: DashMap<String, BTreeMap<String, Row>>,
}

impl MemoryStore {
    pub fn new(config: Arc<StoreConfig>) -> Self {
        MemoryStore {
            router: TenancyRouter::from_config(&config),
            config,
            units: DashMap::new(),
        }
    }

    /// Number of rows in a tenant's storage unit, across all tenants when
    /// the unit is shared.
    pub fn unit_len(&self, tenant: &str) -> usize {
        let route = self.router.table_route(tenant);
        self.units.get(&route.unit).map(|u| u.len()).unwrap_or(0)
    }

    fn put_row(&self, route: &Route, row: Row) {
        let key = row.get(KEY_ATTR).cloned().unwrap_or_default();
        self.units
            .entry(route.unit.clone())
            .or_default()
            .insert(key, row);
    }

    fn get_row(&self, route: &Route, id: &str) -> Option<Row> {
        self.units
            .get(&route.unit)
            .and_then(|unit| unit.get(&route.row_key(id)).cloned())
    }

    fn conditional_update(&self, route: &Route, record: &mut Record) -> Result<()> {
        let key = route.row_key(&record.id);
        let expected = record.version.unwrap_or(0);
        let mut attrs = codec::to_row(record, &key, LOCKED_ON_UPDATE)?;
        attrs.insert("version".to_string(), (expected + 1).to_string());

        let mut unit = self.units.entry(route.unit.clone()).or_default();
        let current = unit.get(&key).map(codec::stored_version);
        if current != Some(expected) {
            tracing::debug!(
                "[MEMORY {}] version conflict on {} (expected {}, found {:?})",
                route.partition,
                record.id,
                expected,
                current
            );
            record.version = Some(VERSION_CONFLICT);
            return Ok(());
        }
        let merged = match unit.get(&key) {
            Some(stored) => codec::merge_update(stored, &attrs),
            None => attrs,
        };
        unit.insert(key, merged);
        record.version = Some(expected + 1);
        Ok(())
    }

    /// Unlocked update. A record that is not stored is left absent.
    fn merge_into(&self, route: &Route, record: &Record) -> Result<()> {
        let key = route.row_key(&record.id);
        let attrs = codec::to_row(record, &key, LOCKED_ON_UPDATE)?;
        let mut unit = self.units.entry(route.unit.clone()).or_default();
        let Some(stored) = unit.get(&key) else {
            tracing::debug!(
                "[MEMORY {}] update skipped, no record {}",
                route.partition,
                record.id
            );
            return Ok(());
        };
        let merged = codec::merge_unlocked(stored, &attrs);
        unit.insert(key, merged);
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create(&self, tenant: &str, record: &mut Record) -> Result<Option<String>> {
        if blank(tenant) {
            return Ok(None);
        }
        let route = self.router.table_route(tenant);
        record.stamp_for_create(&route.partition, now_millis());
        let row = codec::to_row(record, &route.row_key(&record.id), &[])?;
        self.put_row(&route, row);
        Ok(Some(record.id.clone()))
    }

    async fn read(&self, tenant: &str, id: &str) -> Result<Option<Record>> {
        if blank(tenant) || blank(id) {
            return Ok(None);
        }
        let route = self.router.table_route(tenant);
        Ok(self
            .get_row(&route, id)
            .and_then(|row| codec::from_row(&row).ok()))
    }

    async fn update(&self, tenant: &str, record: &mut Record) -> Result<()> {
        if blank(tenant) || !record.has_id() {
            return Ok(());
        }
        let route = self.router.table_route(tenant);
        record.updated = Some(now_millis());
        if record.is_locked() {
            self.conditional_update(&route, record)
        } else {
            self.merge_into(&route, record)
        }
    }

    async fn delete(&self, tenant: &str, record: &Record) -> Result<()> {
        if blank(tenant) || !record.has_id() {
            return Ok(());
        }
        let route = self.router.table_route(tenant);
        if let Some(mut unit) = self.units.get_mut(&route.unit) {
            unit.remove(&route.row_key(&record.id));
        }
        Ok(())
    }

    async fn create_all(&self, tenant: &str, records: &mut [Record]) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records.iter_mut() {
            if let Some(id) = self.create(tenant, record).await? {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn read_all(
        &self,
        tenant: &str,
        ids: &[String],
        fetch_all_columns: bool,
    ) -> Result<IndexMap<String, Option<Record>>> {
        let mut results = dedupe_ids(ids);
        if blank(tenant) {
            return Ok(results);
        }
        let route = self.router.table_route(tenant);
        for (id, slot) in results.iter_mut() {
            *slot = self.get_row(&route, id).and_then(|row| {
                let row = if fetch_all_columns {
                    row
                } else {
                    codec::project_core(row)
                };
                codec::from_row(&row).ok()
            });
        }
        Ok(results)
    }

    async fn update_all(&self, tenant: &str, records: &mut [Record]) -> Result<()> {
        for record in records.iter_mut() {
            self.update(tenant, record).await?;
        }
        Ok(())
    }

    async fn delete_all(&self, tenant: &str, records: &[Record]) -> Result<()> {
        for record in records {
            self.delete(tenant, record).await?;
        }
        Ok(())
    }

    async fn read_page(&self, tenant: &str, pager: &mut Pager) -> Result<Vec<Record>> {
        if blank(tenant) {
            return Ok(Vec::new());
        }
        let route = self.router.table_route(tenant);
        let limit = self.config.page_limit(pager.limit);
        let Some(unit) = self.units.get(&route.unit) else {
            return Ok(Vec::new());
        };

        let start = match &pager.last_key {
            Some(k) => Bound::Excluded(k.clone()),
            None => Bound::Unbounded,
        };
        let rows: Vec<(String, Row)> = unit
            .range((start, Bound::Unbounded))
            .filter(|(_, row)| {
                !route.shared || row.get("appid").map(String::as_str) == Some(route.partition.as_str())
            })
            .take(limit)
            .map(|(k, row)| (k.clone(), row.clone()))
            .collect();
        drop(unit);

        let last_key = rows.last().map(|(k, _)| k.clone());
        let scanned = rows.len();
        let records: Vec<Record> = rows
            .iter()
            .filter_map(|(key, row)| match codec::from_row(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("[MEMORY {}] skipping undecodable row {}: {}", route.partition, key, e);
                    None
                }
            })
            .collect();
        pager.advance_past(scanned, records.len(), last_key);
        Ok(records)
    }
}

#[async_trait]
impl TenantListener for MemoryStore {
    fn name(&self) -> &str {
        "memory-store"
    }

    async fn on_tenant_created(&self, tenant: &Tenant) -> Result<()> {
        let route = self.router.table_route(&tenant.id);
        self.units.entry(route.unit).or_default();
        Ok(())
    }

    async fn on_tenant_deleted(&self, tenant: &Tenant) -> Result<Option<BackgroundJob>> {
        let route = self.router.table_route(&tenant.id);
        if route.shared {
            if let Some(mut unit) = self.units.get_mut(&route.unit) {
                let before = unit.len();
                unit.retain(|_, row| row.get("appid") != Some(&route.partition));
                tracing::info!(
                    "[MEMORY {}] removed {} shared rows",
                    route.partition,
                    before - unit.len()
                );
            }
        } else {
            self.units.remove(&route.unit);
        }
        Ok(None)
    }
}
