//! Index provisioning and zero-downtime rebuilds.
//!
//! A dedicated tenant's index is reached through its alias. A rebuild copies
//! every record from the object store into a staging index, swaps the alias
//! and only then deletes the previous index; queries keep hitting the old
//! index until the swap. Any failure before the swap drops the staging index
//! and leaves the alias untouched. Shared indexes hold many tenants and are
//! never swapped: their rebuild re-copies the tenant's records in place.
//! Writes to the tenant's index wait on its write gate until the rebuild is
//! done.

use crate::config::StoreConfig;
use crate::error::{Result, ShortstackError};
use crate::lifecycle::{BackgroundJob, TenantListener};
use crate::search::engine::TantivySearch;
use crate::search::index::SearchIndex;
use crate::store::ObjectStore;
use crate::types::{Pager, Tenant};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub alias: String,
    /// Physical index now serving the alias.
    pub physical: String,
    /// Physical index served before the rebuild, if any.
    pub previous: Option<String>,
    pub copied: usize,
    pub swapped: bool,
}

pub struct IndexLifecycle {
    search: Arc<TantivySearch>,
}

impl IndexLifecycle {
    pub fn new(search: Arc<TantivySearch>) -> Self {
        IndexLifecycle { search }
    }

    fn config(&self) -> &StoreConfig {
        self.search.config()
    }

    /// Physical index currently serving `alias`, if one exists.
    pub fn resolve_alias(&self, alias: &str) -> Option<String> {
        let physical = self.search.resolve(alias);
        self.search.physical_exists(&physical).then_some(physical)
    }

    /// Provisions a tenant's index. Shared tenants reuse the shared index.
    pub async fn create_index(&self, tenant: &str) -> Result<String> {
        if tenant.trim().is_empty() {
            return Err(ShortstackError::Validation("blank tenant id".to_string()));
        }
        let physical = self.search.physical_name(tenant);
        self.search.load(&physical, true)?;
        tracing::info!("[INDEX {}] ready at {}", tenant.trim(), physical);
        Ok(physical)
    }

    /// Removes a dedicated tenant's index and alias. Shared tenants have
    /// their documents deleted from the shared index in a background task.
    pub async fn delete_index(&self, tenant: &str) -> Result<Option<BackgroundJob>> {
        if tenant.trim().is_empty() {
            return Ok(None);
        }
        let route = self.search.router().index_route(tenant);
        if route.shared {
            let Some(index) = self.search.load(&route.unit, false)? else {
                return Ok(None);
            };
            let partition = route.partition.clone();
            let job: BackgroundJob = tokio::task::spawn_blocking(move || {
                let removed = index.delete_partition(&partition)?;
                tracing::info!("[INDEX {}] removed {} shared documents", partition, removed);
                Ok(removed)
            });
            return Ok(Some(job));
        }

        let physical = self.search.resolve(&route.unit);
        self.search.aliases().remove(&route.unit)?;
        self.search.drop_physical(&physical)?;
        if physical != route.unit {
            self.search.drop_physical(&route.unit)?;
        }
        tracing::info!("[INDEX {}] deleted {}", route.partition, physical);
        Ok(None)
    }

    /// Rebuilds a tenant's index from the object store.
    pub async fn rebuild_index(&self, tenant: &str, store: &dyn ObjectStore) -> Result<RebuildReport> {
        if tenant.trim().is_empty() {
            return Err(ShortstackError::Validation("blank tenant id".to_string()));
        }
        let route = self.search.router().index_route(tenant);
        let gate = self.search.write_gate(&route);
        let _closed = gate.write().await;
        if route.shared {
            return self.rebuild_in_place(tenant, store).await;
        }

        let alias = route.unit.clone();
        let previous = self.resolve_alias(&alias);
        let staging_name = format!("{}_{}", alias, &crate::types::new_record_id()[..8]);
        tracing::info!(
            "[REBUILD {}] staging {} (serving {:?})",
            route.partition,
            staging_name,
            previous
        );
        let staging = self.search.create_physical(&staging_name)?;

        let copied = match self.copy_into(tenant, &staging, store).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("[REBUILD {}] copy failed, dropping {}: {}", route.partition, staging_name, e);
                drop(staging);
                if let Err(drop_err) = self.search.drop_physical(&staging_name) {
                    tracing::warn!("[REBUILD {}] could not drop {}: {}", route.partition, staging_name, drop_err);
                }
                return Err(e);
            }
        };
        drop(staging);

        if let Err(e) = self.search.aliases().swap(&alias, &staging_name) {
            tracing::error!("[REBUILD {}] alias swap failed: {}", route.partition, e);
            if let Err(drop_err) = self.search.drop_physical(&staging_name) {
                tracing::warn!("[REBUILD {}] could not drop {}: {}", route.partition, staging_name, drop_err);
            }
            return Err(e);
        }

        if let Some(old) = previous.as_deref().filter(|old| *old != staging_name) {
            if let Err(e) = self.search.drop_physical(old) {
                tracing::warn!("[REBUILD {}] could not delete old index {}: {}", route.partition, old, e);
            }
        }
        tracing::info!(
            "[REBUILD {}] {} -> {} ({} records)",
            route.partition,
            alias,
            staging_name,
            copied
        );
        Ok(RebuildReport {
            alias,
            physical: staging_name,
            previous,
            copied,
            swapped: true,
        })
    }

    async fn rebuild_in_place(&self, tenant: &str, store: &dyn ObjectStore) -> Result<RebuildReport> {
        let route = self.search.router().index_route(tenant);
        let index = self
            .search
            .load(&route.unit, true)?
            .ok_or_else(|| ShortstackError::IndexNotFound(route.unit.clone()))?;
        let copied = self.copy_into(tenant, &index, store).await?;
        tracing::info!(
            "[REBUILD {}] re-copied {} records into shared {}",
            route.partition,
            copied,
            route.unit
        );
        Ok(RebuildReport {
            alias: route.unit.clone(),
            physical: route.unit,
            previous: None,
            copied,
            swapped: false,
        })
    }

    /// Streams every record of the tenant into `target`, committing every
    /// `reindex_batch_size` documents.
    async fn copy_into(&self, tenant: &str, target: &Arc<SearchIndex>, store: &dyn ObjectStore) -> Result<usize> {
        let batch = self.config().reindex_batch_size.max(1);
        let partition = tenant.trim().to_string();
        let mut pager = Pager::new(batch);
        let mut copied = 0;
        let mut pending = 0;
        loop {
            let before = pager.page;
            let page = store.read_page(tenant, &mut pager).await?;
            if page.is_empty() {
                if pager.page == before {
                    break;
                }
                continue;
            }
            let records: Vec<_> = page
                .into_iter()
                .map(|mut r| {
                    r.appid = partition.clone();
                    r
                })
                .collect();
            pending += records.len();
            copied += records.len();
            let index = Arc::clone(target);
            let flush = pending >= batch;
            tokio::task::spawn_blocking(move || {
                index.stage(&records)?;
                if flush {
                    index.commit()?;
                }
                Ok::<_, ShortstackError>(())
            })
            .await??;
            if flush {
                tracing::debug!("[REBUILD {}] flushed at {} records", partition, copied);
                pending = 0;
            }
        }
        let index = Arc::clone(target);
        tokio::task::spawn_blocking(move || index.commit()).await??;
        Ok(copied)
    }
}

#[async_trait]
impl TenantListener for IndexLifecycle {
    fn name(&self) -> &str {
        "search-index"
    }

    async fn on_tenant_created(&self, tenant: &Tenant) -> Result<()> {
        self.create_index(&tenant.id).await.map(|_| ())
    }

    async fn on_tenant_deleted(&self, tenant: &Tenant) -> Result<Option<BackgroundJob>> {
        self.delete_index(&tenant.id).await
    }
}
