use crate::config::{BackendKind, StoreConfig};
use crate::error::Result;
use crate::lifecycle::{BackgroundJob, TenantLifecycle, TenantListener};
use crate::search::{IndexLifecycle, RebuildReport, SearchEngine, TantivySearch};
use crate::store::{Backend, ObjectStore};
use crate::types::{Record, Tenant};
use std::sync::Arc;

/// Wires the configured object store, the search engine and the tenant
/// lifecycle together.
///
/// The store and the index are updated independently; [`Shortstack::put`] and
/// [`Shortstack::remove`] do both for callers that want them in step.
pub struct Shortstack {
    config: Arc<StoreConfig>,
    backend: Arc<Backend>,
    search: Arc<TantivySearch>,
    indices: Arc<IndexLifecycle>,
    lifecycle: TenantLifecycle,
}

impl Shortstack {
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let search = Arc::new(TantivySearch::open(Arc::clone(&config))?);
        let backend = Arc::new(Backend::build(
            Arc::clone(&config),
            Some(Arc::clone(&search)),
        )?);
        if backend.kind() != BackendKind::Index {
            search.attach_store(Arc::clone(&backend) as Arc<dyn ObjectStore>);
        }
        let indices = Arc::new(IndexLifecycle::new(Arc::clone(&search)));

        let lifecycle = TenantLifecycle::new();
        lifecycle.register(Arc::clone(&backend) as Arc<dyn TenantListener>);
        lifecycle.register(Arc::clone(&indices) as Arc<dyn TenantListener>);

        tracing::info!(
            "[SHORTSTACK] open: backend={} data_dir={}",
            config.backend,
            config.data_dir.display()
        );
        Ok(Shortstack {
            config,
            backend,
            search,
            indices,
            lifecycle,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Backend {
        &self.backend
    }

    pub fn search(&self) -> &Arc<TantivySearch> {
        &self.search
    }

    pub fn indices(&self) -> &IndexLifecycle {
        &self.indices
    }

    pub fn lifecycle(&self) -> &TenantLifecycle {
        &self.lifecycle
    }

    pub async fn create_tenant(&self, tenant: &Tenant) -> Result<()> {
        self.lifecycle.tenant_created(tenant).await
    }

    /// Returns the handles of any background cleanup still running.
    pub async fn delete_tenant(&self, tenant: &Tenant) -> Result<Vec<BackgroundJob>> {
        self.lifecycle.tenant_deleted(tenant).await
    }

    pub async fn reindex(&self, tenant: &str) -> Result<RebuildReport> {
        self.indices
            .rebuild_index(tenant, self.backend.as_ref())
            .await
    }

    /// Creates the record in the store and indexes it.
    pub async fn put(&self, tenant: &str, record: &mut Record) -> Result<Option<String>> {
        let id = self.backend.create(tenant, record).await?;
        if id.is_some() && self.backend.kind() != BackendKind::Index {
            self.search.index(tenant, record).await?;
        }
        Ok(id)
    }

    pub async fn remove(&self, tenant: &str, record: &Record) -> Result<()> {
        self.backend.delete(tenant, record).await?;
        if self.backend.kind() != BackendKind::Index {
            self.search.unindex(tenant, record).await?;
        }
        Ok(())
    }

    /// Stops the backend client. Pending batch retries are cancelled.
    pub fn shutdown(&self) {
        tracing::info!("[SHORTSTACK] shutting down");
        self.backend.shutdown();
    }
}
