//! Wide-column adapter over a [`TableClient`].
//!
//! Dedicated tenants own a table named `{table_prefix}-{tenant}` keyed by
//! record id. Shared tenants live in the shared table, keyed by
//! `{tenant}_{id}`, with an `(appid, id)` secondary index for paging.
//!
//! Consistency: single-item writes are visible to subsequent reads. Batch
//! writes are visible item by item as the service processes them; a batch
//! still being retried is partially visible.

use crate::client::ClientHandle;
use crate::config::StoreConfig;
use crate::error::{Result, ShortstackError};
use crate::lifecycle::{BackgroundJob, TenantListener};
use crate::store::batch::{BatchExecutor, FailurePolicy};
use crate::store::codec::{self, Row, KEY_ATTR, LOCKED_ON_UPDATE};
use crate::store::table_client::{
    Condition, ScanPage, SecondaryIndex, TableClient, TableError, TableSpec, WriteRequest,
};
use crate::store::{blank, dedupe_ids, write_failed, ObjectStore};
use crate::tenancy::{Route, TenancyRouter, SHARED_PARTITION_INDEX};
use crate::types::{now_millis, Pager, Record, Tenant, VERSION_CONFLICT};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;

pub type TableClientHandle = ClientHandle<Arc<dyn TableClient>>;

#[derive(Clone)]
pub struct TableStore {
    config: Arc<StoreConfig>,
    router: TenancyRouter,
    client: Arc<TableClientHandle>,
    executor: BatchExecutor,
}

impl TableStore {
    pub fn new(config: Arc<StoreConfig>, client: Arc<TableClientHandle>) -> Self {
        let executor = BatchExecutor::new(&config, client.cancel_signal());
        TableStore {
            router: TenancyRouter::from_config(&config),
            config,
            client,
            executor,
        }
    }

    /// Store over an already connected client.
    pub fn with_client(config: Arc<StoreConfig>, client: Arc<dyn TableClient>) -> Self {
        Self::new(config, Arc::new(ClientHandle::ready("table", client)))
    }

    pub fn router(&self) -> &TenancyRouter {
        &self.router
    }

    pub fn shutdown(&self) {
        self.client.shutdown();
    }

    fn table_spec(&self, name: &str, shared: bool) -> TableSpec {
        TableSpec {
            name: name.to_string(),
            key_attr: KEY_ATTR.to_string(),
            secondary_index: shared.then(|| SecondaryIndex {
                name: SHARED_PARTITION_INDEX.to_string(),
                partition_attr: "appid".to_string(),
                sort_attr: "id".to_string(),
            }),
            encrypted: self.config.encryption_at_rest,
        }
    }

    /// Creates the tenant's table, or the shared table if it does not exist
    /// yet. Existing tables are left alone.
    pub async fn create_table(&self, tenant: &str) -> Result<()> {
        let route = self.router.table_route(tenant);
        let client = self.client.get().await?;
        let spec = self.table_spec(&route.unit, route.shared);
        let created = self
            .executor
            .timed(async { Ok::<_, ShortstackError>(client.create_table(spec).await) })
            .await?;
        match created {
            Ok(()) => {
                tracing::info!(
                    "[TABLE {}] created table {} (encrypted={})",
                    route.partition,
                    route.unit,
                    self.config.encryption_at_rest
                );
                Ok(())
            }
            Err(TableError::TableExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops a dedicated tenant's table.
    pub async fn delete_table(&self, tenant: &str) -> Result<()> {
        let route = self.router.table_route(tenant);
        if route.shared {
            return Err(ShortstackError::InvalidQuery(format!(
                "refusing to drop shared table {} for tenant {}",
                route.unit, route.partition
            )));
        }
        let client = self.client.get().await?;
        match self
            .executor
            .timed(async { Ok::<_, ShortstackError>(client.delete_table(&route.unit).await) })
            .await?
        {
            Ok(()) | Err(TableError::TableNotFound(_)) => {
                tracing::info!("[TABLE {}] dropped table {}", route.partition, route.unit);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Removes every row of a shared tenant from the shared table, one
    /// partition page at a time. Returns how many rows were deleted.
    pub async fn delete_shared_rows(&self, tenant: &str) -> Result<usize> {
        let route = self.router.table_route(tenant);
        let mut pager = Pager::new(self.executor.read_chunk());
        let mut deleted = 0;
        loop {
            let page = self.scan_rows(&route, &pager).await?;
            if page.rows.is_empty() {
                break;
            }
            pager.advance(page.rows.len(), page.last_key);
            let requests: Vec<WriteRequest> = page
                .rows
                .iter()
                .filter_map(|row| row.get(KEY_ATTR).cloned())
                .map(WriteRequest::Delete)
                .collect();
            deleted += self.batch_write(&route, requests, FailurePolicy::Raise).await?;
        }
        tracing::info!(
            "[TABLE {}] removed {} rows from shared table {}",
            route.partition,
            deleted,
            route.unit
        );
        Ok(deleted)
    }

    async fn batch_write(
        &self,
        route: &Route,
        requests: Vec<WriteRequest>,
        policy: FailurePolicy,
    ) -> Result<usize> {
        let client = self.client.get().await?;
        let table = route.unit.clone();
        self.executor
            .write_all(&route.partition, requests, policy, |chunk| {
                let client = Arc::clone(&client);
                let table = table.clone();
                async move {
                    client
                        .batch_write(&table, chunk)
                        .await
                        .map_err(ShortstackError::from)
                }
            })
            .await
    }

    async fn scan_rows(&self, route: &Route, pager: &Pager) -> Result<ScanPage> {
        let client = self.client.get().await?;
        let limit = self.config.page_limit(pager.limit);
        let start_after = pager.last_key.clone();
        let page = if route.shared {
            self.executor
                .timed(async {
                    client
                        .query_partition(
                            &route.unit,
                            SHARED_PARTITION_INDEX,
                            &route.partition,
                            start_after,
                            limit,
                        )
                        .await
                        .map_err(ShortstackError::from)
                })
                .await?
        } else {
            self.executor
                .timed(async {
                    client
                        .scan(&route.unit, start_after, limit)
                        .await
                        .map_err(ShortstackError::from)
                })
                .await?
        };
        Ok(page)
    }

    /// Batch-reads rows by physical key. Keys with no item are absent.
    async fn fetch_rows(
        &self,
        route: &Route,
        keys: Vec<String>,
        projection: Option<Vec<String>>,
        policy: FailurePolicy,
    ) -> Result<Vec<Row>> {
        let client = self.client.get().await?;
        let table = route.unit.clone();
        self.executor
            .read_all(&route.partition, keys, policy, |chunk| {
                let client = Arc::clone(&client);
                let table = table.clone();
                let projection = projection.clone();
                async move {
                    let out = client
                        .batch_get(&table, chunk, projection)
                        .await
                        .map_err(ShortstackError::from)?;
                    Ok::<_, ShortstackError>((out.rows, out.unprocessed))
                }
            })
            .await
    }

    async fn conditional_update(&self, route: &Route, record: &mut Record) -> Result<()> {
        let client = self.client.get().await?;
        let key = route.row_key(&record.id);
        let expected = record.version.unwrap_or(0);
        let mut attrs = codec::to_row(record, &key, LOCKED_ON_UPDATE)?;
        attrs.insert("version".to_string(), (expected + 1).to_string());

        let result = self
            .executor
            .timed(async {
                let condition = Some(Condition::version_equals(expected));
                Ok::<_, ShortstackError>(
                    client
                        .update_item(&route.unit, &key, attrs, condition)
                        .await,
                )
            })
            .await?;
        match result {
            Ok(()) => {
                record.version = Some(expected + 1);
                Ok(())
            }
            Err(TableError::ConditionFailed(_)) => {
                tracing::debug!(
                    "[TABLE {}] version conflict on {} (expected {})",
                    route.partition,
                    record.id,
                    expected
                );
                record.version = Some(VERSION_CONFLICT);
                Ok(())
            }
            Err(e) => write_failed(&self.config, &route.partition, e.into(), ()),
        }
    }
}

#[async_trait]
impl ObjectStore for TableStore {
    async fn create(&self, tenant: &str, record: &mut Record) -> Result<Option<String>> {
        if blank(tenant) {
            return Ok(None);
        }
        let route = self.router.table_route(tenant);
        record.stamp_for_create(&route.partition, now_millis());
        let row = codec::to_row(record, &route.row_key(&record.id), &[])?;

        let client = self.client.get().await?;
        let result = self
            .executor
            .timed(async { client.put_item(&route.unit, row, None).await.map_err(ShortstackError::from) })
            .await;
        match result {
            Ok(()) => Ok(Some(record.id.clone())),
            Err(e) => write_failed(&self.config, &route.partition, e, None),
        }
    }

    async fn read(&self, tenant: &str, id: &str) -> Result<Option<Record>> {
        if blank(tenant) || blank(id) {
            return Ok(None);
        }
        let route = self.router.table_route(tenant);
        let key = route.row_key(id);
        let client = match self.client.get().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("[TABLE {}] read {} failed: {}", route.partition, id, e);
                return Ok(None);
            }
        };
        let result = self
            .executor
            .timed(async { client.get_item(&route.unit, &key).await.map_err(ShortstackError::from) })
            .await;
        match result {
            Ok(Some(row)) => match codec::from_row(&row) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    tracing::warn!("[TABLE {}] undecodable row {}: {}", route.partition, key, e);
                    Ok(None)
                }
            },
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::error!("[TABLE {}] read {} failed: {}", route.partition, id, e);
                Ok(None)
            }
        }
    }

    async fn update(&self, tenant: &str, record: &mut Record) -> Result<()> {
        if blank(tenant) || !record.has_id() {
            return Ok(());
        }
        let route = self.router.table_route(tenant);
        record.updated = Some(now_millis());

        if record.is_locked() {
            return self.conditional_update(&route, record).await;
        }

        let key = route.row_key(&record.id);
        let attrs = codec::to_row(record, &key, LOCKED_ON_UPDATE)?;
        let client = self.client.get().await?;
        let result = self
            .executor
            .timed(async {
                Ok::<_, ShortstackError>(
                    client
                        .update_item(&route.unit, &key, attrs, Some(Condition::Exists))
                        .await,
                )
            })
            .await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(TableError::ConditionFailed(_))) => {
                tracing::debug!(
                    "[TABLE {}] update skipped, no record {}",
                    route.partition,
                    record.id
                );
                Ok(())
            }
            Ok(Err(e)) => write_failed(&self.config, &route.partition, e.into(), ()),
            Err(e) => write_failed(&self.config, &route.partition, e, ()),
        }
    }

    async fn delete(&self, tenant: &str, record: &Record) -> Result<()> {
        if blank(tenant) || !record.has_id() {
            return Ok(());
        }
        let route = self.router.table_route(tenant);
        let key = route.row_key(&record.id);
        let client = self.client.get().await?;
        let result = self
            .executor
            .timed(async { client.delete_item(&route.unit, &key).await.map_err(ShortstackError::from) })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => write_failed(&self.config, &route.partition, e, ()),
        }
    }

    async fn create_all(&self, tenant: &str, records: &mut [Record]) -> Result<Vec<String>> {
        if blank(tenant) || records.is_empty() {
            return Ok(Vec::new());
        }
        let route = self.router.table_route(tenant);
        let now = now_millis();
        let mut requests = Vec::with_capacity(records.len());
        for record in records.iter_mut() {
            record.stamp_for_create(&route.partition, now);
            let row = codec::to_row(record, &route.row_key(&record.id), &[])?;
            requests.push(WriteRequest::Put(row));
        }
        self.batch_write(&route, requests, FailurePolicy::for_writes(&self.config))
            .await?;
        Ok(records.iter().map(|r| r.id.clone()).collect())
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
        let route = self.router.table_route(tenant);
        let keys: Vec<String> = results.keys().map(|id| route.row_key(id)).collect();
        let projection = (!fetch_all_columns)
            .then(|| codec::CORE_ATTRS.iter().map(|a| a.to_string()).collect::<Vec<_>>());

        let rows = self
            .fetch_rows(&route, keys, projection, FailurePolicy::Swallow)
            .await
            .unwrap_or_else(|e| {
                tracing::error!("[TABLE {}] batch read aborted: {}", route.partition, e);
                Vec::new()
            });

        for row in rows {
            match codec::from_row(&row) {
                Ok(record) => {
                    if let Some(slot) = results.get_mut(&record.id) {
                        *slot = Some(record);
                    }
                }
                Err(e) => tracing::warn!("[TABLE {}] undecodable row: {}", route.partition, e),
            }
        }
        Ok(results)
    }

    /// Lock-active records go through the conditional single-row path. The
    /// rest are merged into their stored rows and written back in batches;
    /// ids with no stored row are skipped.
    async fn update_all(&self, tenant: &str, records: &mut [Record]) -> Result<()> {
        if blank(tenant) || records.is_empty() {
            return Ok(());
        }
        let route = self.router.table_route(tenant);
        let now = now_millis();
        let mut updates: IndexMap<String, Row> = IndexMap::new();
        for record in records.iter_mut() {
            if !record.has_id() {
                continue;
            }
            record.updated = Some(now);
            if record.is_locked() {
                self.conditional_update(&route, record).await?;
                continue;
            }
            let key = route.row_key(&record.id);
            let attrs = codec::to_row(record, &key, LOCKED_ON_UPDATE)?;
            updates.insert(key, attrs);
        }
        if updates.is_empty() {
            return Ok(());
        }

        let policy = FailurePolicy::for_writes(&self.config);
        let keys: Vec<String> = updates.keys().cloned().collect();
        let stored = match self.fetch_rows(&route, keys, None, policy).await {
            Ok(rows) => rows,
            Err(e) => return write_failed(&self.config, &route.partition, e, ()),
        };
        let stored: IndexMap<String, Row> = stored
            .into_iter()
            .filter_map(|row| row.get(KEY_ATTR).cloned().map(|k| (k, row)))
            .collect();

        let mut requests = Vec::with_capacity(updates.len());
        for (key, attrs) in &updates {
            match stored.get(key) {
                Some(row) => requests.push(WriteRequest::Put(codec::merge_unlocked(row, attrs))),
                None => tracing::debug!("[TABLE {}] update skipped, no record at {}", route.partition, key),
            }
        }
        if !requests.is_empty() {
            self.batch_write(&route, requests, policy).await?;
        }
        Ok(())
    }

    async fn delete_all(&self, tenant: &str, records: &[Record]) -> Result<()> {
        if blank(tenant) || records.is_empty() {
            return Ok(());
        }
        let route = self.router.table_route(tenant);
        let keys: IndexMap<String, ()> = records
            .iter()
            .filter(|r| r.has_id())
            .map(|r| (route.row_key(&r.id), ()))
            .collect();
        let requests = keys.into_keys().map(WriteRequest::Delete).collect();
        self.batch_write(&route, requests, FailurePolicy::for_writes(&self.config))
            .await?;
        Ok(())
    }

    async fn read_page(&self, tenant: &str, pager: &mut Pager) -> Result<Vec<Record>> {
        if blank(tenant) {
            return Ok(Vec::new());
        }
        let route = self.router.table_route(tenant);
        let page = self.scan_rows(&route, pager).await?;
        let scanned = page.rows.len();
        let mut records = Vec::with_capacity(scanned);
        for row in &page.rows {
            match codec::from_row(row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    "[TABLE {}] skipping undecodable row {}: {}",
                    route.partition,
                    row.get(KEY_ATTR).map(String::as_str).unwrap_or_default(),
                    e
                ),
            }
        }
        pager.advance_past(scanned, records.len(), page.last_key);
        Ok(records)
    }
}

#[async_trait]
impl TenantListener for TableStore {
    fn name(&self) -> &str {
        "table-store"
    }

    async fn on_tenant_created(&self, tenant: &Tenant) -> Result<()> {
        self.create_table(&tenant.id).await
    }

    async fn on_tenant_deleted(&self, tenant: &Tenant) -> Result<Option<BackgroundJob>> {
        if !self.router.table_route(&tenant.id).shared {
            self.delete_table(&tenant.id).await?;
            return Ok(None);
        }
        let store = self.clone();
        let tenant_id = tenant.id.clone();
        Ok(Some(tokio::spawn(async move {
            store.delete_shared_rows(&tenant_id).await
        })))
    }
}
