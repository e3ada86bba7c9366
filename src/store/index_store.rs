//! Adapter that keeps records only in the search index.
//!
//! Consistency: a write commits and reloads the index before returning, so it
//! is visible to the next read. Conditional updates are serialized through a
//! process-wide lock; another process writing the same index is not fenced.
//! An unlocked update of a record that is not indexed is skipped. Writes wait
//! while the tenant's index is being rebuilt. `read_page` pages in document
//! key order, with the last key carried in `last_key` as base64 text.

use crate::config::StoreConfig;
use crate::error::{Result, ShortstackError};
use crate::lifecycle::{BackgroundJob, TenantListener};
use crate::search::{SearchEngine, TantivySearch};
use crate::store::codec::{self, LOCKED_ON_UPDATE};
use crate::store::{blank, dedupe_ids, write_failed, ObjectStore};
use crate::tenancy::TenancyRouter;
use crate::types::{now_millis, Pager, Record, Tenant, VERSION_CONFLICT};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct IndexStore {
    config: Arc<StoreConfig>,
    router: TenancyRouter,
    search: Arc<TantivySearch>,
    update_lock: Mutex<()>,
}

pub(crate) fn encode_cursor(key: &str) -> String {
    STANDARD.encode(key)
}

pub(crate) fn decode_cursor(cursor: &str) -> Result<String> {
    STANDARD
        .decode(cursor)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ShortstackError::InvalidQuery(format!("bad page cursor: {}", cursor)))
}

impl IndexStore {
    pub fn new(config: Arc<StoreConfig>, search: Arc<TantivySearch>) -> Self {
        IndexStore {
            router: TenancyRouter::from_config(&config),
            config,
            search,
            update_lock: Mutex::new(()),
        }
    }

    async fn lookup(&self, tenant: &str, id: &str) -> Option<Record> {
        match self.search.get(tenant, id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!("[STORE {}] index read of {} failed: {}", tenant.trim(), id, e);
                None
            }
        }
    }

    /// Applies an update against the stored record, keeping protected
    /// attributes. Lock-active records must match the stored version; an
    /// unlocked update of a missing record yields nothing.
    fn merge(&self, partition: &str, current: Option<&Record>, record: &mut Record) -> Result<Option<Record>> {
        let key = codec::KEY_ATTR;
        let mut update = codec::to_row(record, key, LOCKED_ON_UPDATE)?;
        let stored_version = current.and_then(|c| c.version).unwrap_or(0);

        if record.is_locked() {
            let expected = record.version.unwrap_or(0);
            if current.is_none() || stored_version != expected {
                tracing::debug!(
                    "[STORE {}] version conflict on {} (expected {}, found {})",
                    partition,
                    record.id,
                    expected,
                    stored_version
                );
                record.version = Some(VERSION_CONFLICT);
                return Ok(None);
            }
            update.insert("version".to_string(), (expected + 1).to_string());
        } else if stored_version > 0 {
            update.insert("version".to_string(), stored_version.to_string());
        }

        let Some(current) = current else {
            tracing::debug!("[STORE {}] update skipped, no record {}", partition, record.id);
            return Ok(None);
        };
        let merged = codec::merge_update(&codec::to_row(current, key, &[])?, &update);
        let mut merged = codec::from_row(&merged)?;
        merged.appid = partition.to_string();
        if record.is_locked() {
            record.version = merged.version;
        }
        Ok(Some(merged))
    }
}

#[async_trait]
impl ObjectStore for IndexStore {
    async fn create(&self, tenant: &str, record: &mut Record) -> Result<Option<String>> {
        if blank(tenant) {
            return Ok(None);
        }
        let route = self.router.index_route(tenant);
        record.stamp_for_create(&route.partition, now_millis());
        match self.search.index(tenant, record).await {
            Ok(()) => Ok(Some(record.id.clone())),
            Err(e) => write_failed(&self.config, &route.partition, e, None),
        }
    }

    async fn read(&self, tenant: &str, id: &str) -> Result<Option<Record>> {
        if blank(tenant) || blank(id) {
            return Ok(None);
        }
        Ok(self.lookup(tenant, id).await)
    }

    async fn update(&self, tenant: &str, record: &mut Record) -> Result<()> {
        if blank(tenant) || !record.has_id() {
            return Ok(());
        }
        let route = self.router.index_route(tenant);
        record.updated = Some(now_millis());

        let _guard = self.update_lock.lock().await;
        let current = self.lookup(tenant, &record.id).await;
        let Some(merged) = self.merge(&route.partition, current.as_ref(), record)? else {
            return Ok(());
        };
        if let Err(e) = self.search.index(tenant, &merged).await {
            return write_failed(&self.config, &route.partition, e, ());
        }
        Ok(())
    }

    async fn delete(&self, tenant: &str, record: &Record) -> Result<()> {
        if blank(tenant) || !record.has_id() {
            return Ok(());
        }
        match self.search.unindex(tenant, record).await {
            Ok(()) => Ok(()),
            Err(e) => write_failed(&self.config, tenant.trim(), e, ()),
        }
    }

    async fn create_all(&self, tenant: &str, records: &mut [Record]) -> Result<Vec<String>> {
        if blank(tenant) || records.is_empty() {
            return Ok(Vec::new());
        }
        let route = self.router.index_route(tenant);
        let now = now_millis();
        for record in records.iter_mut() {
            record.stamp_for_create(&route.partition, now);
        }
        match self.search.index_all(tenant, records).await {
            Ok(()) => Ok(records.iter().map(|r| r.id.clone()).collect()),
            Err(e) => write_failed(&self.config, &route.partition, e, Vec::new()),
        }
    }

    async fn read_all(
        &self,
        tenant: &str,
        ids: &[String],
        fetch_all_columns: bool,
    ) -> Result<IndexMap<String, Option<Record>>> {
        let mut results = dedupe_ids(ids);
        if blank(tenant) || results.is_empty() {
            return Ok(results);
        }
        let wanted: Vec<String> = results.keys().cloned().collect();
        for mut record in self.search.find_by_ids(tenant, &wanted).await {
            if !fetch_all_columns {
                record.properties.clear();
            }
            if let Some(slot) = results.get_mut(&record.id) {
                *slot = Some(record);
            }
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
        if blank(tenant) || records.is_empty() {
            return Ok(());
        }
        match self.search.unindex_all(tenant, records).await {
            Ok(()) => Ok(()),
            Err(e) => write_failed(&self.config, tenant.trim(), e, ()),
        }
    }

    async fn read_page(&self, tenant: &str, pager: &mut Pager) -> Result<Vec<Record>> {
        if blank(tenant) {
            return Ok(Vec::new());
        }
        let limit = self.config.page_limit(pager.limit);
        let after = pager.last_key.as_deref().map(decode_cursor).transpose()?;
        let page = self.search.scan_after(tenant, after, limit).await?;
        let next = page.last_key.as_deref().map(encode_cursor);
        pager.advance_past(page.scanned, page.records.len(), next);
        Ok(page.records)
    }
}

#[async_trait]
impl TenantListener for IndexStore {
    fn name(&self) -> &str {
        "index-store"
    }

    async fn on_tenant_created(&self, _tenant: &Tenant) -> Result<()> {
        Ok(())
    }

    /// Documents go away with the tenant's index.
    async fn on_tenant_deleted(&self, _tenant: &Tenant) -> Result<Option<BackgroundJob>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_cursor() {
        assert_eq!(decode_cursor(&encode_cursor("acme_r1")).unwrap(), "acme_r1");
        assert!(decode_cursor("not base64!").is_err());
        assert!(decode_cursor("").is_err());
        assert!(decode_cursor(&STANDARD.encode([0xff, 0xfe])).is_err());
    }
}
