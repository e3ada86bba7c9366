//! Wire contract of the wide-column table service.
//!
//! Mirrors the operations a hosted key/attribute store exposes: table
//! provisioning, single-item reads and (conditional) writes, bounded batch
//! calls that may leave work unprocessed, key-ordered scans and queries on a
//! partition secondary index.

use crate::store::codec::Row;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("table {0} does not exist")]
    TableNotFound(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("condition check failed for {0}")]
    ConditionFailed(String),

    #[error("provisioned throughput exceeded: {0}")]
    Throttled(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("service error: {0}")]
    Service(String),
}

pub type TableResult<T> = std::result::Result<T, TableError>;

/// Secondary index used to page through one partition of a shared table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryIndex {
    pub name: String,
    pub partition_attr: String,
    pub sort_attr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub key_attr: String,
    pub secondary_index: Option<SecondaryIndex>,
    pub encrypted: bool,
}

/// Precondition on a single-item write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// The stored item's attribute must equal `value`. A missing attribute
    /// compares equal to `"0"` for the `version` attribute only.
    AttributeEquals { name: String, value: String },
    /// An item must already be stored under the key.
    Exists,
}

impl Condition {
    pub fn version_equals(version: i64) -> Self {
        Condition::AttributeEquals {
            name: "version".to_string(),
            value: version.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Put(Row),
    Delete(String),
}

impl WriteRequest {
    pub fn key(&self) -> Option<&str> {
        match self {
            WriteRequest::Put(row) => row.get(crate::store::codec::KEY_ATTR).map(String::as_str),
            WriteRequest::Delete(key) => Some(key.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetOutput {
    pub rows: Vec<Row>,
    pub unprocessed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub rows: Vec<Row>,
    /// Key to resume after, absent when the scan is exhausted.
    pub last_key: Option<String>,
}

#[async_trait]
pub trait TableClient: Send + Sync {
    async fn create_table(&self, spec: TableSpec) -> TableResult<()>;

    async fn delete_table(&self, name: &str) -> TableResult<()>;

    async fn table_exists(&self, name: &str) -> TableResult<bool>;

    async fn get_item(&self, table: &str, key: &str) -> TableResult<Option<Row>>;

    async fn put_item(&self, table: &str, row: Row, condition: Option<Condition>)
        -> TableResult<()>;

    /// Merges `attrs` into the stored item, creating it if absent.
    async fn update_item(
        &self,
        table: &str,
        key: &str,
        attrs: Row,
        condition: Option<Condition>,
    ) -> TableResult<()>;

    async fn delete_item(&self, table: &str, key: &str) -> TableResult<()>;

    /// At most 25 requests, no two for the same key. Returns the requests
    /// the service did not process.
    async fn batch_write(&self, table: &str, requests: Vec<WriteRequest>)
        -> TableResult<Vec<WriteRequest>>;

    /// At most 100 distinct keys. Keys with no item are absent from `rows`.
    async fn batch_get(
        &self,
        table: &str,
        keys: Vec<String>,
        projection: Option<Vec<String>>,
    ) -> TableResult<BatchGetOutput>;

    /// Key-ordered scan of the whole table starting after `start_after`.
    async fn scan(
        &self,
        table: &str,
        start_after: Option<String>,
        limit: usize,
    ) -> TableResult<ScanPage>;

    /// Key-ordered page of one partition through a secondary index.
    async fn query_partition(
        &self,
        table: &str,
        index: &str,
        partition: &str,
        start_after: Option<String>,
        limit: usize,
    ) -> TableResult<ScanPage>;
}
