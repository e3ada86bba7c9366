//! Search side: the [`SearchEngine`] contract and its tantivy adapter.
//!
//! Every operation is tenant-scoped and optionally type-scoped. Reads never
//! fail: index errors are logged and surface as empty results, so a broken
//! index degrades search instead of taking down the caller. Writes return
//! their errors.
//!
//! Paged finds fill `pager.count` with the total number of hits. Results are
//! ordered by `pager.sort_by` (`timestamp` by default, or `updated`), newest
//! first unless `pager.desc` is false; `_score` orders by relevance.

pub mod alias;
pub mod document;
pub mod engine;
pub mod geo;
pub mod index;
pub mod lifecycle;
pub mod schema;
pub mod translator;

use crate::error::Result;
use crate::types::{Pager, Record};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

pub use alias::AliasTable;
pub use engine::TantivySearch;
pub use index::SearchIndex;
pub use lifecycle::{IndexLifecycle, RebuildReport};

/// Type of the child records that carry coordinates for nearby searches.
pub const LOCATION_TYPE: &str = "address";

#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn index(&self, tenant: &str, record: &Record) -> Result<()>;

    async fn index_all(&self, tenant: &str, records: &[Record]) -> Result<()>;

    async fn unindex(&self, tenant: &str, record: &Record) -> Result<()>;

    async fn unindex_all(&self, tenant: &str, records: &[Record]) -> Result<()>;

    async fn find_by_id(&self, tenant: &str, id: &str) -> Option<Record>;

    /// Records found for `ids`, in request order. Unknown ids are skipped.
    async fn find_by_ids(&self, tenant: &str, ids: &[String]) -> Vec<Record>;

    /// Equality on every (`match_all`) or any term. Keys ending in `>`, `<`,
    /// `>=` or `<=` compare instead. An empty map finds nothing.
    async fn find_terms(
        &self,
        tenant: &str,
        kind: Option<&str>,
        terms: &IndexMap<String, Value>,
        match_all: bool,
        pager: &mut Pager,
    ) -> Vec<Record>;

    async fn find_prefix(
        &self,
        tenant: &str,
        kind: Option<&str>,
        field: &str,
        prefix: &str,
        pager: &mut Pager,
    ) -> Vec<Record>;

    /// `*` matches any run of characters, `?` exactly one.
    async fn find_wildcard(
        &self,
        tenant: &str,
        kind: Option<&str>,
        field: &str,
        pattern: &str,
        pager: &mut Pager,
    ) -> Vec<Record>;

    async fn find_term_in_list(
        &self,
        tenant: &str,
        kind: Option<&str>,
        field: &str,
        values: &[Value],
        pager: &mut Pager,
    ) -> Vec<Record>;

    /// Records carrying all of `tags`.
    async fn find_tagged(
        &self,
        tenant: &str,
        kind: Option<&str>,
        tags: &[String],
        pager: &mut Pager,
    ) -> Vec<Record>;

    /// Free text. Text that cannot be parsed matches everything.
    async fn find_query(
        &self,
        tenant: &str,
        kind: Option<&str>,
        query: &str,
        pager: &mut Pager,
    ) -> Vec<Record>;

    async fn find_similar(
        &self,
        tenant: &str,
        kind: Option<&str>,
        exclude_id: &str,
        fields: &[String],
        like_text: &str,
        pager: &mut Pager,
    ) -> Vec<Record>;

    /// Records of `kind` whose [`LOCATION_TYPE`] children lie within
    /// `radius_km` of the point, optionally narrowed by free text.
    #[allow(clippy::too_many_arguments)]
    async fn find_nearby(
        &self,
        tenant: &str,
        kind: &str,
        query: &str,
        radius_km: f64,
        lat: f64,
        lng: f64,
        pager: &mut Pager,
    ) -> Vec<Record>;

    async fn count(&self, tenant: &str, kind: Option<&str>) -> u64;

    async fn count_terms(
        &self,
        tenant: &str,
        kind: Option<&str>,
        terms: &IndexMap<String, Value>,
    ) -> u64;
}
