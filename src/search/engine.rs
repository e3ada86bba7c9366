//! Tantivy-backed [`SearchEngine`].
//!
//! Dedicated tenants get one physical index each, reached through an alias so
//! a rebuild can switch to a fresh copy atomically. Shared tenants live
//! together in one physical index and are separated by `appid`, which every
//! query requires.
//!
//! Every write to a tenant's index holds that tenant's write gate shared; a
//! rebuild holds it exclusively, so no write lands in an index that is about
//! to be replaced. Searches and document loads run on the blocking pool.

use crate::config::StoreConfig;
use crate::error::{Result, ShortstackError};
use crate::search::alias::AliasTable;
use crate::search::document;
use crate::search::geo::GeoPoint;
use crate::search::index::SearchIndex;
use crate::search::schema::{doc_key, GEO_LAT, GEO_LNG, KEY, TIMESTAMP, UPDATED};
use crate::search::translator::Translator;
use crate::search::{SearchEngine, LOCATION_TYPE};
use crate::store::ObjectStore;
use crate::tenancy::{Route, TenancyRouter};
use crate::types::{Pager, Record};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tantivy::collector::{Count, DocSetCollector, TopDocs};
use tantivy::columnar::StrColumn;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query};
use tantivy::{DocAddress, DocId, Searcher, SegmentReader, TantivyDocument};
use tokio::sync::RwLock;

/// Upper bound on location records considered by one nearby search.
const MAX_NEARBY_CANDIDATES: usize = 10_000;

/// Which slice of the hits to return and in what order.
#[derive(Debug, Clone, Copy)]
struct Window {
    limit: usize,
    offset: usize,
    /// Fast field to order by; `None` for relevance.
    sort: Option<&'static str>,
    desc: bool,
}

impl Window {
    fn from_pager(config: &StoreConfig, pager: &Pager) -> Self {
        let limit = config.page_limit(pager.limit);
        let sort = match pager.sort_by.as_deref().map(str::trim) {
            None | Some("") | Some(TIMESTAMP) => Some(TIMESTAMP),
            Some(UPDATED) => Some(UPDATED),
            Some("_score") => None,
            Some(other) => {
                tracing::debug!("[SEARCH] cannot sort on {}, using timestamp", other);
                Some(TIMESTAMP)
            }
        };
        Window {
            limit,
            offset: pager.offset(limit),
            sort,
            desc: pager.desc,
        }
    }

    fn relevance(limit: usize) -> Self {
        Window {
            limit: limit.max(1),
            offset: 0,
            sort: None,
            desc: true,
        }
    }
}

/// One page of a key-ordered scan.
#[derive(Debug, Default)]
pub struct KeyPage {
    pub records: Vec<Record>,
    /// Documents passed over, readable or not.
    pub scanned: usize,
    /// `_key` of the last document passed over.
    pub last_key: Option<String>,
}

pub struct TantivySearch {
    base_path: PathBuf,
    config: Arc<StoreConfig>,
    router: TenancyRouter,
    indexes: DashMap<String, Arc<SearchIndex>>,
    aliases: AliasTable,
    store: OnceCell<Arc<dyn ObjectStore>>,
    write_gates: DashMap<String, Arc<RwLock<()>>>,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

impl TantivySearch {
    /// Opens the engine over `config.index_dir()`. Physical indexes are
    /// opened on first use.
    pub fn open(config: Arc<StoreConfig>) -> Result<Self> {
        let base_path = config.index_dir();
        std::fs::create_dir_all(&base_path)?;
        let aliases = AliasTable::load(&base_path)?;
        tracing::info!(
            "[SEARCH] opened {} ({} aliases)",
            base_path.display(),
            aliases.len()
        );
        Ok(TantivySearch {
            base_path,
            router: TenancyRouter::from_config(&config),
            config,
            indexes: DashMap::new(),
            aliases,
            store: OnceCell::new(),
            write_gates: DashMap::new(),
        })
    }

    /// Attaches the object store consulted when hits are not materialized
    /// from the index. Only the first call takes effect.
    pub fn attach_store(&self, store: Arc<dyn ObjectStore>) -> bool {
        self.store.set(store).is_ok()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn router(&self) -> &TenancyRouter {
        &self.router
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Physical index currently serving a logical name.
    pub fn resolve(&self, unit: &str) -> String {
        self.aliases.resolve(unit).unwrap_or_else(|| unit.to_string())
    }

    pub fn physical_name(&self, tenant: &str) -> String {
        self.resolve(&self.router.index_route(tenant).unit)
    }

    pub fn physical_exists(&self, physical: &str) -> bool {
        self.indexes.contains_key(physical) || SearchIndex::exists(self.base_path.join(physical))
    }

    /// Gate serializing writes to a tenant's index against its rebuild.
    pub(crate) fn write_gate(&self, route: &Route) -> Arc<RwLock<()>> {
        let key = format!("{}/{}", route.unit, route.partition);
        Arc::clone(&self.write_gates.entry(key).or_default())
    }

    /// Loaded handle for a physical index, opening or creating it as needed.
    pub(crate) fn load(&self, physical: &str, create: bool) -> Result<Option<Arc<SearchIndex>>> {
        if let Some(index) = self.indexes.get(physical) {
            return Ok(Some(Arc::clone(&index)));
        }
        let path = self.base_path.join(physical);
        if !create && !SearchIndex::exists(&path) {
            return Ok(None);
        }
        match self.indexes.entry(physical.to_string()) {
            Entry::Occupied(e) => Ok(Some(Arc::clone(e.get()))),
            Entry::Vacant(e) => {
                let index = Arc::new(SearchIndex::open_or_create(physical, &path)?);
                tracing::debug!("[SEARCH] loaded index {}", physical);
                e.insert(Arc::clone(&index));
                Ok(Some(index))
            }
        }
    }

    /// Creates a fresh physical index, failing if one already exists.
    pub(crate) fn create_physical(&self, physical: &str) -> Result<Arc<SearchIndex>> {
        if self.physical_exists(physical) {
            return Err(ShortstackError::IndexAlreadyExists(physical.to_string()));
        }
        let index = Arc::new(SearchIndex::create(physical, self.base_path.join(physical))?);
        self.indexes.insert(physical.to_string(), Arc::clone(&index));
        Ok(index)
    }

    /// Unloads a physical index and removes its files.
    pub(crate) fn drop_physical(&self, physical: &str) -> Result<()> {
        self.indexes.remove(physical);
        let path = self.base_path.join(physical);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
            tracing::info!("[SEARCH] dropped index {}", physical);
        }
        Ok(())
    }

    fn index_for_read(&self, tenant: &str) -> Option<(Route, Arc<SearchIndex>)> {
        let route = self.router.index_route(tenant);
        let physical = self.resolve(&route.unit);
        match self.load(&physical, false) {
            Ok(Some(index)) => Some((route, index)),
            Ok(None) => None,
            Err(e) => {
                tracing::error!("[SEARCH {}] cannot open {}: {}", route.partition, physical, e);
                None
            }
        }
    }

    fn index_for_write(&self, tenant: &str) -> Result<(Route, Arc<SearchIndex>)> {
        let route = self.router.index_route(tenant);
        let physical = self.resolve(&route.unit);
        let index = self
            .load(&physical, true)?
            .ok_or_else(|| ShortstackError::IndexNotFound(physical.clone()))?;
        Ok((route, index))
    }

    /// Record by id straight from the index. Errors propagate.
    pub async fn get(&self, tenant: &str, id: &str) -> Result<Option<Record>> {
        if tenant.trim().is_empty() || id.trim().is_empty() {
            return Ok(None);
        }
        let Some((route, index)) = self.index_for_read(tenant) else {
            return Ok(None);
        };
        let key = doc_key(&route.partition, id);
        blocking(move || {
            let translator = Translator::new(index.inner(), index.fields());
            let clause = translator.key(&key);
            let (mut hits, _) = execute(&index, &route, None, clause, Window::relevance(1))?;
            Ok(hits.pop())
        })
        .await
    }

    /// Up to `limit` of a tenant's records in `_key` order, starting after
    /// the key `after`.
    pub async fn scan_after(&self, tenant: &str, after: Option<String>, limit: usize) -> Result<KeyPage> {
        if tenant.trim().is_empty() {
            return Ok(KeyPage::default());
        }
        let Some((route, index)) = self.index_for_read(tenant) else {
            return Ok(KeyPage::default());
        };
        blocking(move || scan_keys(&index, &route, after.as_deref(), limit.max(1))).await
    }

    /// Writes records to the tenant's index, creating it if needed.
    async fn upsert(&self, tenant: &str, records: Vec<Record>) -> Result<()> {
        if tenant.trim().is_empty() || records.is_empty() {
            return Ok(());
        }
        let gate = self.write_gate(&self.router.index_route(tenant));
        let _open = gate.read().await;
        let (route, index) = self.index_for_write(tenant)?;
        let records: Vec<Record> = records
            .into_iter()
            .filter(Record::has_id)
            .map(|mut r| {
                r.appid = route.partition.clone();
                r
            })
            .collect();
        let count = records.len();
        tokio::task::spawn_blocking(move || index.upsert(&records)).await??;
        tracing::debug!("[SEARCH {}] indexed {} records", route.partition, count);
        Ok(())
    }

    async fn remove(&self, tenant: &str, ids: Vec<String>) -> Result<()> {
        if tenant.trim().is_empty() || ids.is_empty() {
            return Ok(());
        }
        let gate = self.write_gate(&self.router.index_route(tenant));
        let _open = gate.read().await;
        let Some((route, index)) = self.index_for_read(tenant) else {
            return Ok(());
        };
        let keys: Vec<String> = ids
            .iter()
            .filter(|id| !id.trim().is_empty())
            .map(|id| doc_key(&route.partition, id))
            .collect();
        tokio::task::spawn_blocking(move || index.delete_keys(&keys)).await??;
        Ok(())
    }

    /// Runs a paged query and reconciles the hits. Failures log and yield
    /// nothing.
    async fn find<F>(&self, tenant: &str, kind: Option<&str>, pager: &mut Pager, build: F) -> Vec<Record>
    where
        F: FnOnce(&Translator<'_>, &Route, &SearchIndex) -> Result<Option<Box<dyn Query>>> + Send + 'static,
    {
        if tenant.trim().is_empty() {
            return Vec::new();
        }
        let window = Window::from_pager(&self.config, pager);
        let kind = kind.map(str::to_string);
        let outcome = match self.index_for_read(tenant) {
            None => Ok((Vec::new(), 0)),
            Some((route, index)) => {
                blocking(move || {
                    let translator = Translator::new(index.inner(), index.fields());
                    match build(&translator, &route, &index)? {
                        Some(clause) => execute(&index, &route, kind.as_deref(), clause, window),
                        None => Ok((Vec::new(), 0)),
                    }
                })
                .await
            }
        };
        let (hits, total) = match outcome {
            Ok(found) => found,
            Err(e) => {
                tracing::error!("[SEARCH {}] query failed: {}", tenant.trim(), e);
                (Vec::new(), 0)
            }
        };
        let (records, total) = self.reconcile(tenant, hits, total).await;
        pager.count = total as u64;
        records
    }

    async fn count_matching<F>(&self, tenant: &str, kind: Option<&str>, build: F) -> u64
    where
        F: FnOnce(&Translator<'_>) -> Option<Box<dyn Query>> + Send + 'static,
    {
        if tenant.trim().is_empty() {
            return 0;
        }
        let Some((route, index)) = self.index_for_read(tenant) else {
            return 0;
        };
        let kind = kind.map(str::to_string);
        let partition = route.partition.clone();
        let counted = blocking(move || {
            let translator = Translator::new(index.inner(), index.fields());
            let Some(clause) = build(&translator) else {
                return Ok(0);
            };
            let query = translator.scoped(&route.partition, kind.as_deref(), clause);
            Ok(index.searcher().search(&query, &Count)? as u64)
        })
        .await;
        match counted {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("[SEARCH {}] count failed: {}", partition, e);
                0
            }
        }
    }

    /// With `read_from_index` off, replaces each hit by the stored record.
    /// Hits whose record is gone are dropped and logged as drift.
    async fn reconcile(&self, tenant: &str, hits: Vec<Record>, total: usize) -> (Vec<Record>, usize) {
        if self.config.read_from_index || hits.is_empty() {
            return (hits, total);
        }
        let Some(store) = self.store.get() else {
            return (hits, total);
        };
        let ids: Vec<String> = hits.iter().map(|r| r.id.clone()).collect();
        let mut stored = match store.read_all(tenant, &ids, true).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!("[SEARCH {}] reconciliation read failed: {}", tenant.trim(), e);
                return (Vec::new(), total);
            }
        };
        let mut total = total;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match stored.swap_remove(&id).flatten() {
                Some(record) => records.push(record),
                None => {
                    tracing::warn!(
                        "[DRIFT {}] {} is indexed but missing from the store",
                        tenant.trim(),
                        id
                    );
                    total = total.saturating_sub(1);
                }
            }
        }
        (records, total)
    }
}

/// Parent ids of location records within `radius_km` of `center`.
fn nearby_parents(
    index: &SearchIndex,
    route: &Route,
    center: GeoPoint,
    radius_km: f64,
) -> Result<Vec<String>> {
    let translator = Translator::new(index.inner(), index.fields());
    let query = translator.scoped(&route.partition, Some(LOCATION_TYPE), Box::new(AllQuery));
    let searcher = index.searcher();
    let collector = TopDocs::with_limit(MAX_NEARBY_CANDIDATES).custom_score(
        move |segment_reader: &SegmentReader| {
            let ff = segment_reader.fast_fields();
            let lat = ff.f64(GEO_LAT).ok();
            let lng = ff.f64(GEO_LNG).ok();
            move |doc: DocId| {
                let point = lat
                    .as_ref()
                    .and_then(|c| c.first(doc))
                    .zip(lng.as_ref().and_then(|c| c.first(doc)));
                match point {
                    Some((lat, lng)) => -center.distance_km(lat, lng),
                    None => f64::NEG_INFINITY,
                }
            }
        },
    );
    let hits = searcher.search(&query, &collector)?;

    let mut parents = Vec::new();
    for (score, addr) in hits {
        if -score > radius_km {
            break;
        }
        let record = load_record(&searcher, index, addr)?;
        if let Some(parent) = record.parentid {
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }
    }
    Ok(parents)
}

fn load_record(searcher: &Searcher, index: &SearchIndex, addr: DocAddress) -> Result<Record> {
    let doc: TantivyDocument = searcher.doc(addr)?;
    document::from_document(index.fields(), &doc)
}

/// Runs a tenant-scoped query and materializes one window of hits from
/// `_source`. Returns the hits and the total match count.
fn execute(
    index: &SearchIndex,
    route: &Route,
    kind: Option<&str>,
    clause: Box<dyn Query>,
    window: Window,
) -> Result<(Vec<Record>, usize)> {
    let translator = Translator::new(index.inner(), index.fields());
    let query = translator.scoped(&route.partition, kind, clause);
    let searcher = index.searcher();
    let top = TopDocs::with_limit(window.limit.max(1)).and_offset(window.offset);

    let (total, addrs): (usize, Vec<DocAddress>) = match window.sort {
        None => {
            let (total, hits) = searcher.search(&query, &(Count, top))?;
            (total, hits.into_iter().map(|(_, a)| a).collect())
        }
        Some(field) => {
            let desc = window.desc;
            let collector = top.custom_score(move |segment_reader: &SegmentReader| {
                let column = segment_reader.fast_fields().i64(field).ok();
                move |doc: DocId| match column.as_ref().and_then(|c| c.first(doc)) {
                    Some(v) if desc => v,
                    Some(v) => v.saturating_neg(),
                    None => i64::MIN,
                }
            });
            let (total, hits) = searcher.search(&query, &(Count, collector))?;
            (total, hits.into_iter().map(|(_, a)| a).collect())
        }
    };

    let mut records = Vec::with_capacity(addrs.len());
    let mut total = total;
    for addr in addrs {
        match load_record(&searcher, index, addr) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!("[SEARCH {}] unreadable document in {}: {}", route.partition, index.name(), e);
                total = total.saturating_sub(1);
            }
        }
    }
    Ok((records, total))
}

/// Scoped documents in `_key` order after `after`, read from the `_key`
/// fast column of each segment.
fn scan_keys(index: &SearchIndex, route: &Route, after: Option<&str>, limit: usize) -> Result<KeyPage> {
    let translator = Translator::new(index.inner(), index.fields());
    let query = translator.scoped(&route.partition, None, Box::new(AllQuery));
    let searcher = index.searcher();
    let addrs = searcher.search(&query, &DocSetCollector)?;

    let mut columns: HashMap<u32, Option<StrColumn>> = HashMap::new();
    let mut keyed: Vec<(String, DocAddress)> = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let column = columns.entry(addr.segment_ord).or_insert_with(|| {
            searcher
                .segment_reader(addr.segment_ord)
                .fast_fields()
                .str(KEY)
                .ok()
                .flatten()
        });
        let Some(ord) = column.as_ref().and_then(|c| c.term_ords(addr.doc_id).next()) else {
            continue;
        };
        let mut key = String::new();
        let found = column.as_ref().map(|c| c.ord_to_str(ord, &mut key)).transpose()?;
        if found == Some(true) && after.map_or(true, |a| key.as_str() > a) {
            keyed.push((key, addr));
        }
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.truncate(limit);

    let mut page = KeyPage {
        records: Vec::with_capacity(keyed.len()),
        scanned: keyed.len(),
        last_key: keyed.last().map(|(k, _)| k.clone()),
    };
    for (key, addr) in keyed {
        match load_record(&searcher, index, addr) {
            Ok(record) => page.records.push(record),
            Err(e) => {
                tracing::warn!("[SEARCH {}] skipping unreadable document {}: {}", route.partition, key, e)
            }
        }
    }
    Ok(page)
}

#[async_trait]
impl SearchEngine for TantivySearch {
    async fn index(&self, tenant: &str, record: &Record) -> Result<()> {
        self.upsert(tenant, vec![record.clone()]).await
    }

    async fn index_all(&self, tenant: &str, records: &[Record]) -> Result<()> {
        self.upsert(tenant, records.to_vec()).await
    }

    async fn unindex(&self, tenant: &str, record: &Record) -> Result<()> {
        self.remove(tenant, vec![record.id.clone()]).await
    }

    async fn unindex_all(&self, tenant: &str, records: &[Record]) -> Result<()> {
        self.remove(tenant, records.iter().map(|r| r.id.clone()).collect())
            .await
    }

    async fn find_by_id(&self, tenant: &str, id: &str) -> Option<Record> {
        let found = match self.get(tenant, id).await {
            Ok(found) => found?,
            Err(e) => {
                tracing::error!("[SEARCH {}] lookup of {} failed: {}", tenant.trim(), id, e);
                return None;
            }
        };
        let (mut records, _) = self.reconcile(tenant, vec![found], 1).await;
        records.pop()
    }

    async fn find_by_ids(&self, tenant: &str, ids: &[String]) -> Vec<Record> {
        if tenant.trim().is_empty() || ids.is_empty() {
            return Vec::new();
        }
        let wanted = ids.to_vec();
        let outcome = match self.index_for_read(tenant) {
            None => Ok((Vec::new(), 0)),
            Some((route, index)) => {
                blocking(move || {
                    let translator = Translator::new(index.inner(), index.fields());
                    match translator.ids(&wanted) {
                        Some(clause) => execute(&index, &route, None, clause, Window::relevance(wanted.len())),
                        None => Ok((Vec::new(), 0)),
                    }
                })
                .await
            }
        };
        let (hits, total) = match outcome {
            Ok(found) => found,
            Err(e) => {
                tracing::error!("[SEARCH {}] lookup failed: {}", tenant.trim(), e);
                (Vec::new(), 0)
            }
        };
        let (found, _) = self.reconcile(tenant, hits, total).await;
        let mut by_id: IndexMap<String, Record> =
            found.into_iter().map(|r| (r.id.clone(), r)).collect();
        ids.iter().filter_map(|id| by_id.swap_remove(id)).collect()
    }

    async fn find_terms(
        &self,
        tenant: &str,
        kind: Option<&str>,
        terms: &IndexMap<String, Value>,
        match_all: bool,
        pager: &mut Pager,
    ) -> Vec<Record> {
        let terms = terms.clone();
        self.find(tenant, kind, pager, move |t, _, _| Ok(t.terms(&terms, match_all)))
            .await
    }

    async fn find_prefix(
        &self,
        tenant: &str,
        kind: Option<&str>,
        field: &str,
        prefix: &str,
        pager: &mut Pager,
    ) -> Vec<Record> {
        if field.trim().is_empty() || prefix.is_empty() {
            return Vec::new();
        }
        let (field, prefix) = (field.to_string(), prefix.to_string());
        self.find(tenant, kind, pager, move |t, _, _| t.prefix(&field, &prefix).map(Some))
            .await
    }

    async fn find_wildcard(
        &self,
        tenant: &str,
        kind: Option<&str>,
        field: &str,
        pattern: &str,
        pager: &mut Pager,
    ) -> Vec<Record> {
        if field.trim().is_empty() || pattern.is_empty() {
            return Vec::new();
        }
        let (field, pattern) = (field.to_string(), pattern.to_string());
        self.find(tenant, kind, pager, move |t, _, _| t.wildcard(&field, &pattern).map(Some))
            .await
    }

    async fn find_term_in_list(
        &self,
        tenant: &str,
        kind: Option<&str>,
        field: &str,
        values: &[Value],
        pager: &mut Pager,
    ) -> Vec<Record> {
        let (field, values) = (field.to_string(), values.to_vec());
        self.find(tenant, kind, pager, move |t, _, _| Ok(t.term_in_list(&field, &values)))
            .await
    }

    async fn find_tagged(
        &self,
        tenant: &str,
        kind: Option<&str>,
        tags: &[String],
        pager: &mut Pager,
    ) -> Vec<Record> {
        let tags = tags.to_vec();
        self.find(tenant, kind, pager, move |t, _, _| Ok(t.tagged(&tags))).await
    }

    async fn find_query(
        &self,
        tenant: &str,
        kind: Option<&str>,
        query: &str,
        pager: &mut Pager,
    ) -> Vec<Record> {
        let query = query.to_string();
        self.find(tenant, kind, pager, move |t, _, _| Ok(Some(t.free_text(&query))))
            .await
    }

    async fn find_similar(
        &self,
        tenant: &str,
        kind: Option<&str>,
        exclude_id: &str,
        fields: &[String],
        like_text: &str,
        pager: &mut Pager,
    ) -> Vec<Record> {
        let (exclude_id, fields, like_text) = (exclude_id.to_string(), fields.to_vec(), like_text.to_string());
        self.find(tenant, kind, pager, move |t, route, _| {
            Ok(t.similar(&doc_key(&route.partition, &exclude_id), &fields, &like_text))
        })
        .await
    }

    async fn find_nearby(
        &self,
        tenant: &str,
        kind: &str,
        query: &str,
        radius_km: f64,
        lat: f64,
        lng: f64,
        pager: &mut Pager,
    ) -> Vec<Record> {
        let Some(center) = GeoPoint::new(lat, lng) else {
            tracing::warn!("[SEARCH {}] invalid point {},{}", tenant.trim(), lat, lng);
            return Vec::new();
        };
        if radius_km.is_nan() || radius_km <= 0.0 || kind.trim().is_empty() {
            return Vec::new();
        }
        let query = query.to_string();
        self.find(tenant, Some(kind), pager, move |t, route, index| {
            let parents = nearby_parents(index, route, center, radius_km)?;
            tracing::debug!(
                "[SEARCH {}] {} parents within {}km",
                route.partition,
                parents.len(),
                radius_km
            );
            let Some(in_range) = t.ids(&parents) else {
                return Ok(None);
            };
            Ok(Some(Box::new(BooleanQuery::new(vec![
                (Occur::Must, in_range),
                (Occur::Must, t.free_text(&query)),
            ])) as Box<dyn Query>))
        })
        .await
    }

    async fn count(&self, tenant: &str, kind: Option<&str>) -> u64 {
        self.count_matching(tenant, kind, |_| Some(Box::new(AllQuery)))
            .await
    }

    async fn count_terms(
        &self,
        tenant: &str,
        kind: Option<&str>,
        terms: &IndexMap<String, Value>,
    ) -> u64 {
        let terms = terms.clone();
        self.count_matching(tenant, kind, move |t| t.terms(&terms, true))
            .await
    }
}
