//! Embedded SQLite adapter.
//!
//! Every storage unit is a table of `(key, appid, id, version, doc)` where
//! `doc` is the codec row as JSON. Shared tables carry an `(appid, id)`
//! index so one tenant's rows can be paged and deleted without touching the
//! others. Tables are created on first write.
//!
//! Consistency: a single connection serializes all statements, so reads see
//! every committed write. Conditional updates run inside a transaction.

use crate::client::ClientHandle;
use crate::config::StoreConfig;
use crate::error::{Result, ShortstackError};
use crate::lifecycle::{BackgroundJob, TenantListener};
use crate::store::batch::{BatchExecutor, FailurePolicy};
use crate::store::codec::{self, Row, KEY_ATTR, LOCKED_ON_UPDATE};
use crate::store::table_client::WriteRequest;
use crate::store::{blank, dedupe_ids, write_failed, ObjectStore};
use crate::tenancy::{Route, TenancyRouter};
use crate::types::{now_millis, Pager, Record, Tenant, VERSION_CONFLICT};
use async_trait::async_trait;
use indexmap::IndexMap;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub type SqlitePool = Arc<Mutex<Connection>>;

const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone)]
pub struct SqliteStore {
    config: Arc<StoreConfig>,
    router: TenancyRouter,
    client: Arc<ClientHandle<SqlitePool>>,
    executor: BatchExecutor,
}

/// How a `Put` in a write chunk lands on the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutMode {
    Replace,
    /// Merge into the stored row as an unlocked update; absent rows stay absent.
    MergeExisting,
}

enum CasOutcome {
    Applied(i64),
    Conflict,
}

impl SqliteStore {
    /// Opens (lazily, on first use) the database at `config.sqlite_path()`.
    pub fn open(config: Arc<StoreConfig>) -> Result<Self> {
        let path = config.sqlite_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let handle = ClientHandle::new("sqlite", move || {
            let path = path.clone();
            async move {
                tokio::task::spawn_blocking(move || open_connection(path))
                    .await?
                    .map(|conn| Arc::new(Mutex::new(conn)))
            }
        });
        Ok(Self::with_handle(config, Arc::new(handle)))
    }

    pub fn with_handle(config: Arc<StoreConfig>, client: Arc<ClientHandle<SqlitePool>>) -> Self {
        let executor = BatchExecutor::new(&config, client.cancel_signal());
        SqliteStore {
            router: TenancyRouter::from_config(&config),
            config,
            client,
            executor,
        }
    }

    pub fn shutdown(&self) {
        self.client.shutdown();
    }

    /// Runs `f` against the connection on the blocking pool, under the
    /// per-request timeout.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.client.get().await?;
        run_blocking(&self.executor, pool, f).await
    }

    async fn write_requests(
        &self,
        route: &Route,
        requests: Vec<WriteRequest>,
        policy: FailurePolicy,
        mode: PutMode,
    ) -> Result<usize> {
        let pool = self.client.get().await?;
        let unit = route.unit.clone();
        let shared = route.shared;
        let executor = self.executor.clone();
        self.executor
            .write_all(&route.partition, requests, policy, |chunk| {
                let pool = Arc::clone(&pool);
                let unit = unit.clone();
                let executor = executor.clone();
                async move {
                    run_blocking(&executor, pool, move |conn| {
                        ensure_table(conn, &unit, shared)?;
                        let tx = conn.transaction()?;
                        for req in &chunk {
                            match req {
                                WriteRequest::Put(row) => match mode {
                                    PutMode::Replace => put_row(&tx, &unit, row)?,
                                    PutMode::MergeExisting => {
                                        merge_row(&tx, &unit, row)?;
                                    }
                                },
                                WriteRequest::Delete(key) => {
                                    tx.execute(
                                        &format!("DELETE FROM {} WHERE key = ?1", quote(&unit)),
                                        params![key],
                                    )?;
                                }
                            }
                        }
                        tx.commit()?;
                        Ok(Vec::<WriteRequest>::new())
                    })
                    .await
                }
            })
            .await
    }

    async fn conditional_update(&self, route: &Route, record: &mut Record) -> Result<()> {
        let key = route.row_key(&record.id);
        let expected = record.version.unwrap_or(0);
        let attrs = codec::to_row(record, &key, LOCKED_ON_UPDATE)?;
        let unit = route.unit.clone();
        let shared = route.shared;

        let outcome = self
            .with_conn(move |conn| {
                ensure_table(conn, &unit, shared)?;
                let tx = conn.transaction()?;
                let Some(stored) = get_row(&tx, &unit, &key)? else {
                    return Ok(CasOutcome::Conflict);
                };
                if codec::stored_version(&stored) != expected {
                    return Ok(CasOutcome::Conflict);
                }
                let mut merged = codec::merge_update(&stored, &attrs);
                merged.insert("version".to_string(), (expected + 1).to_string());
                put_row(&tx, &unit, &merged)?;
                tx.commit()?;
                Ok(CasOutcome::Applied(expected + 1))
            })
            .await;

        match outcome {
            Ok(CasOutcome::Applied(v)) => {
                record.version = Some(v);
                Ok(())
            }
            Ok(CasOutcome::Conflict) => {
                tracing::debug!(
                    "[SQLITE {}] version conflict on {} (expected {})",
                    route.partition,
                    record.id,
                    expected
                );
                record.version = Some(VERSION_CONFLICT);
                Ok(())
            }
            Err(e) => write_failed(&self.config, &route.partition, e, ()),
        }
    }

    /// Drops a dedicated tenant's table. Shared tables are never dropped.
    pub async fn drop_table(&self, tenant: &str) -> Result<()> {
        let route = self.router.table_route(tenant);
        if route.shared || route.unit == self.router.shared_table() {
            return Err(ShortstackError::InvalidQuery(format!(
                "refusing to drop shared table {} for tenant {}",
                route.unit, route.partition
            )));
        }
        let unit = route.unit.clone();
        self.with_conn(move |conn| {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote(&unit)))?;
            Ok(())
        })
        .await?;
        tracing::info!("[SQLITE {}] dropped table {}", route.partition, route.unit);
        Ok(())
    }

    async fn delete_shared_rows(&self, tenant: &str) -> Result<usize> {
        let route = self.router.table_route(tenant);
        let unit = route.unit.clone();
        let partition = route.partition.clone();
        let removed = self
            .with_conn(move |conn| {
                ensure_table(conn, &unit, true)?;
                let n = conn.execute(
                    &format!("DELETE FROM {} WHERE appid = ?1", quote(&unit)),
                    params![partition],
                )?;
                Ok(n)
            })
            .await?;
        tracing::info!(
            "[SQLITE {}] removed {} rows from shared table {}",
            route.partition,
            removed,
            route.unit
        );
        Ok(removed)
    }
}

async fn run_blocking<T, F>(executor: &BatchExecutor, pool: SqlitePool, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    executor
        .timed(async move {
            tokio::task::spawn_blocking(move || {
                let mut conn = pool
                    .lock()
                    .map_err(|_| ShortstackError::Sqlite("connection mutex poisoned".to_string()))?;
                f(&mut *conn)
            })
            .await?
        })
        .await
}

fn open_connection(path: PathBuf) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let conn = Connection::open_with_flags(&path, flags)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    tracing::info!("[SQLITE] opened {}", path.display());
    Ok(conn)
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn ensure_table(conn: &Connection, unit: &str, shared: bool) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            key TEXT PRIMARY KEY,
            appid TEXT NOT NULL,
            id TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            doc TEXT NOT NULL
        );",
        quote(unit)
    ))?;
    if shared {
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (appid, id);",
            quote(&format!("{}_appid_id", unit)),
            quote(unit)
        ))?;
    }
    Ok(())
}

fn put_row(conn: &Connection, unit: &str, row: &Row) -> Result<()> {
    let key = row
        .get(KEY_ATTR)
        .ok_or_else(|| ShortstackError::MissingField(KEY_ATTR.to_string()))?;
    let doc = serde_json::to_string(row)?;
    conn.execute(
        &format!(
            "INSERT INTO {} (key, appid, id, version, doc) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET appid = excluded.appid, id = excluded.id,
             version = excluded.version, doc = excluded.doc",
            quote(unit)
        ),
        params![
            key,
            row.get("appid").map(String::as_str).unwrap_or_default(),
            row.get("id").map(String::as_str).unwrap_or_default(),
            codec::stored_version(row),
            doc
        ],
    )?;
    Ok(())
}

/// Unlocked update of one stored row. Returns false when nothing is stored
/// under the row's key.
fn merge_row(conn: &Connection, unit: &str, attrs: &Row) -> Result<bool> {
    let key = attrs
        .get(KEY_ATTR)
        .ok_or_else(|| ShortstackError::MissingField(KEY_ATTR.to_string()))?;
    let Some(stored) = get_row(conn, unit, key)? else {
        tracing::debug!("[SQLITE] update skipped, no record at {}", key);
        return Ok(false);
    };
    put_row(conn, unit, &codec::merge_unlocked(&stored, attrs))?;
    Ok(true)
}

fn get_row(conn: &Connection, unit: &str, key: &str) -> Result<Option<Row>> {
    let doc: Option<String> = conn
        .query_row(
            &format!("SELECT doc FROM {} WHERE key = ?1", quote(unit)),
            params![key],
            |r| r.get(0),
        )
        .optional()?;
    doc.map(|d| serde_json::from_str::<Row>(&d).map_err(ShortstackError::from))
        .transpose()
}

fn table_exists(conn: &Connection, unit: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![unit],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[async_trait]
impl ObjectStore for SqliteStore {
    async fn create(&self, tenant: &str, record: &mut Record) -> Result<Option<String>> {
        if blank(tenant) {
            return Ok(None);
        }
        let route = self.router.table_route(tenant);
        record.stamp_for_create(&route.partition, now_millis());
        let row = codec::to_row(record, &route.row_key(&record.id), &[])?;
        let unit = route.unit.clone();
        let shared = route.shared;

        let result = self
            .with_conn(move |conn| {
                ensure_table(conn, &unit, shared)?;
                put_row(conn, &unit, &row)
            })
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
        let unit = route.unit.clone();
        let key = route.row_key(id);
        let result = self
            .with_conn(move |conn| {
                if !table_exists(conn, &unit)? {
                    return Ok(None);
                }
                get_row(conn, &unit, &key)
            })
            .await;
        match result.and_then(|row| row.map(|r| codec::from_row(&r)).transpose()) {
            Ok(record) => Ok(record),
            Err(e) => {
                tracing::error!("[SQLITE {}] read {} failed: {}", route.partition, id, e);
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
        let unit = route.unit.clone();
        let shared = route.shared;
        let result = self
            .with_conn(move |conn| {
                ensure_table(conn, &unit, shared)?;
                let tx = conn.transaction()?;
                merge_row(&tx, &unit, &attrs)?;
                tx.commit()?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => write_failed(&self.config, &route.partition, e, ()),
        }
    }

    async fn delete(&self, tenant: &str, record: &Record) -> Result<()> {
        if blank(tenant) || !record.has_id() {
            return Ok(());
        }
        let route = self.router.table_route(tenant);
        let requests = vec![WriteRequest::Delete(route.row_key(&record.id))];
        self.write_requests(
            &route,
            requests,
            FailurePolicy::for_writes(&self.config),
            PutMode::Replace,
        )
        .await?;
        Ok(())
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
            requests.push(WriteRequest::Put(codec::to_row(
                record,
                &route.row_key(&record.id),
                &[],
            )?));
        }
        self.write_requests(
            &route,
            requests,
            FailurePolicy::for_writes(&self.config),
            PutMode::Replace,
        )
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
        let pool = match self.client.get().await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("[SQLITE {}] batch read failed: {}", route.partition, e);
                return Ok(results);
            }
        };
        let keys: Vec<String> = results.keys().map(|id| route.row_key(id)).collect();
        let unit = route.unit.clone();
        let executor = self.executor.clone();

        let rows = self
            .executor
            .read_all(&route.partition, keys, FailurePolicy::Swallow, |chunk| {
                let pool = Arc::clone(&pool);
                let unit = unit.clone();
                let executor = executor.clone();
                async move {
                    run_blocking(&executor, pool, move |conn| {
                        if !table_exists(conn, &unit)? {
                            return Ok((Vec::new(), Vec::new()));
                        }
                        let placeholders = vec!["?"; chunk.len()].join(", ");
                        let mut stmt = conn.prepare(&format!(
                            "SELECT doc FROM {} WHERE key IN ({})",
                            quote(&unit),
                            placeholders
                        ))?;
                        let docs = stmt
                            .query_map(params_from_iter(chunk.iter()), |r| r.get::<_, String>(0))?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        let rows = docs
                            .iter()
                            .map(|d| serde_json::from_str::<Row>(d).map_err(ShortstackError::from))
                            .collect::<Result<Vec<_>>>()?;
                        Ok((rows, Vec::new()))
                    })
                    .await
                }
            })
            .await
            .unwrap_or_else(|e| {
                tracing::error!("[SQLITE {}] batch read aborted: {}", route.partition, e);
                Vec::new()
            });

        for row in rows {
            let row = if fetch_all_columns {
                row
            } else {
                codec::project_core(row)
            };
            match codec::from_row(&row) {
                Ok(record) => {
                    if let Some(slot) = results.get_mut(&record.id) {
                        *slot = Some(record);
                    }
                }
                Err(e) => tracing::warn!("[SQLITE {}] undecodable row: {}", route.partition, e),
            }
        }
        Ok(results)
    }

    async fn update_all(&self, tenant: &str, records: &mut [Record]) -> Result<()> {
        if blank(tenant) || records.is_empty() {
            return Ok(());
        }
        let route = self.router.table_route(tenant);
        let now = now_millis();
        let mut requests = Vec::new();
        for record in records.iter_mut() {
            if !record.has_id() {
                continue;
            }
            record.updated = Some(now);
            if record.is_locked() {
                self.conditional_update(&route, record).await?;
                continue;
            }
            requests.push(WriteRequest::Put(codec::to_row(
                record,
                &route.row_key(&record.id),
                LOCKED_ON_UPDATE,
            )?));
        }
        if !requests.is_empty() {
            self.write_requests(
                &route,
                requests,
                FailurePolicy::for_writes(&self.config),
                PutMode::MergeExisting,
            )
            .await?;
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
        self.write_requests(
            &route,
            requests,
            FailurePolicy::for_writes(&self.config),
            PutMode::Replace,
        )
        .await?;
        Ok(())
    }

    async fn read_page(&self, tenant: &str, pager: &mut Pager) -> Result<Vec<Record>> {
        if blank(tenant) {
            return Ok(Vec::new());
        }
        let route = self.router.table_route(tenant);
        let limit = self.config.page_limit(pager.limit) as i64;
        let after = pager.last_key.clone().unwrap_or_default();
        let unit = route.unit.clone();
        let shared = route.shared;
        let partition = route.partition.clone();

        let page: Vec<(String, String)> = self
            .with_conn(move |conn| {
                if !table_exists(conn, &unit)? {
                    return Ok(Vec::new());
                }
                let rows = if shared {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT id, doc FROM {} WHERE appid = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
                        quote(&unit)
                    ))?;
                    let rows = stmt
                        .query_map(params![partition, after, limit], |r| {
                            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                } else {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT key, doc FROM {} WHERE key > ?1 ORDER BY key LIMIT ?2",
                        quote(&unit)
                    ))?;
                    let rows = stmt
                        .query_map(params![after, limit], |r| {
                            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                };
                Ok(rows)
            })
            .await?;

        let last_key = page.last().map(|(k, _)| k.clone());
        let mut records = Vec::with_capacity(page.len());
        for (key, doc) in &page {
            let decoded = serde_json::from_str::<Row>(doc)
                .map_err(ShortstackError::from)
                .and_then(|row| codec::from_row(&row));
            match decoded {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    "[SQLITE {}] skipping undecodable row {}: {}",
                    route.partition,
                    key,
                    e
                ),
            }
        }
        pager.advance_past(page.len(), records.len(), last_key);
        Ok(records)
    }
}

#[async_trait]
impl TenantListener for SqliteStore {
    fn name(&self) -> &str {
        "sqlite-store"
    }

    async fn on_tenant_created(&self, tenant: &Tenant) -> Result<()> {
        let route = self.router.table_route(&tenant.id);
        let unit = route.unit.clone();
        let shared = route.shared;
        self.with_conn(move |conn| ensure_table(conn, &unit, shared))
            .await?;
        tracing::info!("[SQLITE {}] table {} ready", route.partition, route.unit);
        Ok(())
    }

    async fn on_tenant_deleted(&self, tenant: &Tenant) -> Result<Option<BackgroundJob>> {
        if self.router.table_route(&tenant.id).shared {
            let store = self.clone();
            let tenant_id = tenant.id.clone();
            return Ok(Some(tokio::spawn(async move {
                store.delete_shared_rows(&tenant_id).await
            })));
        }
        self.drop_table(&tenant.id).await?;
        Ok(None)
    }
}
