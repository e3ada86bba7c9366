//! Object store contract and its backend adapters.
//!
//! Every adapter implements [`ObjectStore`] with the same semantics:
//!
//! - `create` assigns an id and creation timestamp where absent, stamps the
//!   logical tenant name into `appid` and returns the id.
//! - `update` stamps `updated` and never creates: an unlocked update of a
//!   missing record is skipped. Records with a positive version go through a
//!   compare-and-set on the stored version and come back with the version
//!   incremented, or with the version set to `-1` when another writer got
//!   there first. Conflicts are never retried here.
//! - Blank tenant ids and blank record ids are local no-ops.
//! - Reads fail soft: backend errors are logged and surface as absent
//!   records. Writes obey `fail_on_write_error`.
//! - `read_page` is the exception: a scan that cannot continue returns the
//!   error, since callers such as reindexing must not mistake a failure for
//!   the end of the data. Rows that cannot be decoded are logged and
//!   skipped; the page still advances past them, so an empty page with a
//!   moved cursor is not the end of the scan.

pub mod batch;
pub mod codec;
pub mod index_store;
pub mod memory;
pub mod memory_table;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod table;
pub mod table_client;

use crate::client::ClientHandle;
use crate::config::{BackendKind, StoreConfig};
use crate::error::{Result, ShortstackError};
use crate::lifecycle::{BackgroundJob, TenantListener};
use crate::search::TantivySearch;
use crate::types::{Pager, Record, Tenant};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;

pub use batch::{BatchExecutor, FailurePolicy};
pub use codec::Row;
pub use index_store::IndexStore;
pub use memory::MemoryStore;
pub use memory_table::MemoryTableClient;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use table::TableStore;
pub use table_client::{TableClient, TableError};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Persists a new record and returns its id. `None` when the tenant is
    /// blank or a swallowed write error occurred.
    async fn create(&self, tenant: &str, record: &mut Record) -> Result<Option<String>>;

    async fn read(&self, tenant: &str, id: &str) -> Result<Option<Record>>;

    async fn update(&self, tenant: &str, record: &mut Record) -> Result<()>;

    async fn delete(&self, tenant: &str, record: &Record) -> Result<()>;

    /// Returns the ids of the records handed in, in order.
    async fn create_all(&self, tenant: &str, records: &mut [Record]) -> Result<Vec<String>>;

    /// One entry per distinct id, in first-seen order. Ids with no stored
    /// record map to `None`. With `fetch_all_columns = false` records carry
    /// only their core attributes.
    async fn read_all(
        &self,
        tenant: &str,
        ids: &[String],
        fetch_all_columns: bool,
    ) -> Result<IndexMap<String, Option<Record>>>;

    async fn update_all(&self, tenant: &str, records: &mut [Record]) -> Result<()>;

    async fn delete_all(&self, tenant: &str, records: &[Record]) -> Result<()>;

    /// Up to `pager.limit` records after `pager.last_key`. Advances the
    /// pager. An empty page means the scan is done.
    async fn read_page(&self, tenant: &str, pager: &mut Pager) -> Result<Vec<Record>>;
}

/// Distinct ids in first-seen order, blanks dropped.
pub(crate) fn dedupe_ids(ids: &[String]) -> IndexMap<String, Option<Record>> {
    ids.iter()
        .filter(|id| !id.trim().is_empty())
        .map(|id| (id.clone(), None))
        .collect()
}

pub(crate) fn blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Outcome of a write under the configured failure policy: the error is
/// returned when writes fail fast, otherwise it is only logged.
pub(crate) fn write_failed<T>(config: &StoreConfig, label: &str, err: ShortstackError, fallback: T) -> Result<T> {
    tracing::error!("[STORE {}] write failed: {}", label, err);
    if config.fail_on_write_error {
        Err(err)
    } else {
        Ok(fallback)
    }
}

/// Closed set of storage adapters, picked by [`BackendKind`].
pub enum Backend {
    Table(TableStore),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteStore),
    Index(IndexStore),
    Memory(MemoryStore),
}

impl Backend {
    /// Builds the configured adapter. `search` is required for the index
    /// backend and ignored otherwise.
    pub fn build(config: Arc<StoreConfig>, search: Option<Arc<TantivySearch>>) -> Result<Self> {
        tracing::info!("[STORE] building {} backend", config.backend);
        match config.backend {
            BackendKind::Table => {
                let handle = ClientHandle::new("table", || async {
                    Ok(Arc::new(MemoryTableClient::new()) as Arc<dyn TableClient>)
                });
                Ok(Backend::Table(TableStore::new(config, Arc::new(handle))))
            }
            #[cfg(feature = "sqlite")]
            BackendKind::Sqlite => Ok(Backend::Sqlite(SqliteStore::open(config)?)),
            #[cfg(not(feature = "sqlite"))]
            BackendKind::Sqlite => Err(ShortstackError::Config(
                "sqlite backend requires the 'sqlite' feature".to_string(),
            )),
            BackendKind::Index => {
                let search = search.ok_or_else(|| {
                    ShortstackError::Config("index backend needs a search engine".to_string())
                })?;
                Ok(Backend::Index(IndexStore::new(config, search)))
            }
            BackendKind::Memory => Ok(Backend::Memory(MemoryStore::new(config))),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Table(_) => BackendKind::Table,
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(_) => BackendKind::Sqlite,
            Backend::Index(_) => BackendKind::Index,
            Backend::Memory(_) => BackendKind::Memory,
        }
    }

    fn as_store(&self) -> &dyn ObjectStore {
        match self {
            Backend::Table(s) => s,
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(s) => s,
            Backend::Index(s) => s,
            Backend::Memory(s) => s,
        }
    }

    fn as_listener(&self) -> &dyn TenantListener {
        match self {
            Backend::Table(s) => s,
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(s) => s,
            Backend::Index(s) => s,
            Backend::Memory(s) => s,
        }
    }

    /// Stops the backend client; pending batch retries are cancelled.
    pub fn shutdown(&self) {
        match self {
            Backend::Table(s) => s.shutdown(),
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(s) => s.shutdown(),
            Backend::Index(_) | Backend::Memory(_) => {}
        }
    }
}

#[async_trait]
impl ObjectStore for Backend {
    async fn create(&self, tenant: &str, record: &mut Record) -> Result<Option<String>> {
        self.as_store().create(tenant, record).await
    }

    async fn read(&self, tenant: &str, id: &str) -> Result<Option<Record>> {
        self.as_store().read(tenant, id).await
    }

    async fn update(&self, tenant: &str, record: &mut Record) -> Result<()> {
        self.as_store().update(tenant, record).await
    }

    async fn delete(&self, tenant: &str, record: &Record) -> Result<()> {
        self.as_store().delete(tenant, record).await
    }

    async fn create_all(&self, tenant: &str, records: &mut [Record]) -> Result<Vec<String>> {
        self.as_store().create_all(tenant, records).await
    }

    async fn read_all(
        &self,
        tenant: &str,
        ids: &[String],
        fetch_all_columns: bool,
    ) -> Result<IndexMap<String, Option<Record>>> {
        self.as_store().read_all(tenant, ids, fetch_all_columns).await
    }

    async fn update_all(&self, tenant: &str, records: &mut [Record]) -> Result<()> {
        self.as_store().update_all(tenant, records).await
    }

    async fn delete_all(&self, tenant: &str, records: &[Record]) -> Result<()> {
        self.as_store().delete_all(tenant, records).await
    }

    async fn read_page(&self, tenant: &str, pager: &mut Pager) -> Result<Vec<Record>> {
        self.as_store().read_page(tenant, pager).await
    }
}

#[async_trait]
impl TenantListener for Backend {
    fn name(&self) -> &str {
        self.as_listener().name()
    }

    async fn on_tenant_created(&self, tenant: &Tenant) -> Result<()> {
        self.as_listener().on_tenant_created(tenant).await
    }

    async fn on_tenant_deleted(&self, tenant: &Tenant) -> Result<Option<BackgroundJob>> {
        self.as_listener().on_tenant_deleted(tenant).await
    }
}
