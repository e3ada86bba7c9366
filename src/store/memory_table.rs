//! In-process implementation of [`TableClient`].
//!
//! Enforces the same per-call limits and validation as the hosted service
//! and can be told to throttle or fail upcoming batch calls, which is how the
//! retry paths are exercised without a network.

use crate::config::{MAX_READ_BATCH, MAX_WRITE_BATCH};
use crate::store::codec::{Row, KEY_ATTR};
use crate::store::table_client::{
    BatchGetOutput, Condition, ScanPage, TableClient, TableError, TableResult, TableSpec,
    WriteRequest,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

struct MemTable {
    spec: TableSpec,
    rows: BTreeMap<String, Row>,
}

#[derive(Default)]
pub struct MemoryTableClient {
    tables: DashMap<String, MemTable>,
    throttle_batches: AtomicUsize,
    fail_batches: AtomicUsize,
    batch_write_calls: AtomicUsize,
    batch_get_calls: AtomicUsize,
    max_write_batch: AtomicUsize,
    max_get_batch: AtomicUsize,
}

impl MemoryTableClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` batch calls process only their first item and hand the
    /// rest back as unprocessed. A single-item batch is rejected with a
    /// throttling error instead.
    pub fn throttle_next_batches(&self, n: usize) {
        self.throttle_batches.store(n, Ordering::SeqCst);
    }

    /// The next `n` batch calls fail with a service error.
    pub fn fail_next_batches(&self, n: usize) {
        self.fail_batches.store(n, Ordering::SeqCst);
    }

    pub fn batch_write_calls(&self) -> usize {
        self.batch_write_calls.load(Ordering::SeqCst)
    }

    pub fn batch_get_calls(&self) -> usize {
        self.batch_get_calls.load(Ordering::SeqCst)
    }

    /// Largest batch the client was ever asked to write.
    pub fn max_write_batch(&self) -> usize {
        self.max_write_batch.load(Ordering::SeqCst)
    }

    pub fn max_get_batch(&self) -> usize {
        self.max_get_batch.load(Ordering::SeqCst)
    }

    pub fn describe_table(&self, name: &str) -> Option<TableSpec> {
        self.tables.get(name).map(|t| t.spec.clone())
    }

    pub fn item_count(&self, name: &str) -> usize {
        self.tables.get(name).map(|t| t.rows.len()).unwrap_or(0)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_condition(stored: Option<&Row>, condition: &Option<Condition>, key: &str) -> TableResult<()> {
        let (name, value) = match condition {
            None => return Ok(()),
            Some(Condition::Exists) => {
                return match stored {
                    Some(_) => Ok(()),
                    None => Err(TableError::ConditionFailed(key.to_string())),
                };
            }
            Some(Condition::AttributeEquals { name, value }) => (name, value),
        };
        let stored = stored.ok_or_else(|| TableError::ConditionFailed(key.to_string()))?;
        let actual = match stored.get(name) {
            Some(v) => v.as_str(),
            None if name == "version" => "0",
            None => return Err(TableError::ConditionFailed(key.to_string())),
        };
        if actual == value {
            Ok(())
        } else {
            Err(TableError::ConditionFailed(key.to_string()))
        }
    }

    fn page(rows: Vec<(&String, &Row)>, limit: usize) -> ScanPage {
        let rows: Vec<Row> = rows
            .into_iter()
            .take(limit.max(1))
            .map(|(_, row)| row.clone())
            .collect();
        let last_key = rows.last().and_then(|r| r.get(KEY_ATTR).cloned());
        ScanPage { rows, last_key }
    }
}

#[async_trait]
impl TableClient for MemoryTableClient {
    async fn create_table(&self, spec: TableSpec) -> TableResult<()> {
        match self.tables.entry(spec.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TableError::TableExists(spec.name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(MemTable {
                    spec,
                    rows: BTreeMap::new(),
                });
                Ok(())
            }
        }
    }

    async fn delete_table(&self, name: &str) -> TableResult<()> {
        self.tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| TableError::TableNotFound(name.to_string()))
    }

    async fn table_exists(&self, name: &str) -> TableResult<bool> {
        Ok(self.tables.contains_key(name))
    }

    async fn get_item(&self, table: &str, key: &str) -> TableResult<Option<Row>> {
        let t = self
            .tables
            .get(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;
        Ok(t.rows.get(key).cloned())
    }

    async fn put_item(
        &self,
        table: &str,
        row: Row,
        condition: Option<Condition>,
    ) -> TableResult<()> {
        let key = row
            .get(KEY_ATTR)
            .cloned()
            .ok_or_else(|| TableError::Validation(format!("missing key attribute '{}'", KEY_ATTR)))?;
        let mut t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;
        Self::check_condition(t.rows.get(&key), &condition, &key)?;
        t.rows.insert(key, row);
        Ok(())
    }

    async fn update_item(
        &self,
        table: &str,
        key: &str,
        attrs: Row,
        condition: Option<Condition>,
    ) -> TableResult<()> {
        let mut t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;
        Self::check_condition(t.rows.get(key), &condition, key)?;
        let row = t.rows.entry(key.to_string()).or_insert_with(|| {
            let mut fresh = Row::new();
            fresh.insert(KEY_ATTR.to_string(), key.to_string());
            fresh
        });
        for (name, value) in attrs {
            if name != KEY_ATTR {
                row.insert(name, value);
            }
        }
        Ok(())
    }

    async fn delete_item(&self, table: &str, key: &str) -> TableResult<()> {
        let mut t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;
        t.rows.remove(key);
        Ok(())
    }

    async fn batch_write(
        &self,
        table: &str,
        requests: Vec<WriteRequest>,
    ) -> TableResult<Vec<WriteRequest>> {
        self.batch_write_calls.fetch_add(1, Ordering::SeqCst);
        self.max_write_batch.fetch_max(requests.len(), Ordering::SeqCst);

        if requests.is_empty() || requests.len() > MAX_WRITE_BATCH {
            return Err(TableError::Validation(format!(
                "batch write must contain 1 to {} requests, got {}",
                MAX_WRITE_BATCH,
                requests.len()
            )));
        }
        let mut seen = HashSet::new();
        for req in &requests {
            let key = req
                .key()
                .ok_or_else(|| TableError::Validation("put request without key".to_string()))?;
            if !seen.insert(key.to_string()) {
                return Err(TableError::Validation(format!(
                    "duplicate key in batch write: {}",
                    key
                )));
            }
        }
        if Self::take_one(&self.fail_batches) {
            return Err(TableError::Service("injected batch failure".to_string()));
        }

        let mut requests = requests;
        let unprocessed = if Self::take_one(&self.throttle_batches) {
            if requests.len() == 1 {
                return Err(TableError::Throttled(format!("table {}", table)));
            }
            requests.split_off(1)
        } else {
            Vec::new()
        };

        let mut t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;
        for req in requests {
            match req {
                WriteRequest::Put(row) => {
                    if let Some(key) = row.get(KEY_ATTR).cloned() {
                        t.rows.insert(key, row);
                    }
                }
                WriteRequest::Delete(key) => {
                    t.rows.remove(&key);
                }
            }
        }
        Ok(unprocessed)
    }

    async fn batch_get(
        &self,
        table: &str,
        keys: Vec<String>,
        projection: Option<Vec<String>>,
    ) -> TableResult<BatchGetOutput> {
        self.batch_get_calls.fetch_add(1, Ordering::SeqCst);
        self.max_get_batch.fetch_max(keys.len(), Ordering::SeqCst);

        if keys.is_empty() || keys.len() > MAX_READ_BATCH {
            return Err(TableError::Validation(format!(
                "batch get must contain 1 to {} keys, got {}",
                MAX_READ_BATCH,
                keys.len()
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = keys.iter().find(|k| !seen.insert(k.as_str())) {
            return Err(TableError::Validation(format!(
                "duplicate key in batch get: {}",
                dup
            )));
        }
        if Self::take_one(&self.fail_batches) {
            return Err(TableError::Service("injected batch failure".to_string()));
        }

        let mut keys = keys;
        let unprocessed = if Self::take_one(&self.throttle_batches) {
            if keys.len() == 1 {
                return Err(TableError::Throttled(format!("table {}", table)));
            }
            keys.split_off(1)
        } else {
            Vec::new()
        };

        let t = self
            .tables
            .get(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;
        let rows = keys
            .iter()
            .filter_map(|k| t.rows.get(k))
            .map(|row| match &projection {
                Some(attrs) => row
                    .iter()
                    .filter(|(name, _)| name.as_str() == KEY_ATTR || attrs.contains(name))
                    .map(|(n, v)| (n.clone(), v.clone()))
                    .collect(),
                None => row.clone(),
            })
            .collect();

        Ok(BatchGetOutput { rows, unprocessed })
    }

    async fn scan(
        &self,
        table: &str,
        start_after: Option<String>,
        limit: usize,
    ) -> TableResult<ScanPage> {
        let t = self
            .tables
            .get(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;
        let rows: Vec<(&String, &Row)> = match &start_after {
            Some(after) => t
                .rows
                .range::<String, _>((
                    std::ops::Bound::Excluded(after),
                    std::ops::Bound::Unbounded,
                ))
                .collect(),
            None => t.rows.iter().collect(),
        };
        Ok(Self::page(rows, limit))
    }

    async fn query_partition(
        &self,
        table: &str,
        index: &str,
        partition: &str,
        start_after: Option<String>,
        limit: usize,
    ) -> TableResult<ScanPage> {
        let t = self
            .tables
            .get(table)
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;
        let gsi = t
            .spec
            .secondary_index
            .as_ref()
            .filter(|g| g.name == index)
            .ok_or_else(|| {
                TableError::Validation(format!("table {} has no index {}", table, index))
            })?;

        let mut rows: Vec<(&String, &Row)> = t
            .rows
            .iter()
            .filter(|(_, row)| row.get(&gsi.partition_attr).map(String::as_str) == Some(partition))
            .collect();
        let sort_of = |row: &Row| row.get(&gsi.sort_attr).cloned().unwrap_or_default();
        rows.sort_by(|a, b| sort_of(a.1).cmp(&sort_of(b.1)).then(a.0.cmp(b.0)));
        if let Some(after) = &start_after {
            rows.retain(|(key, _)| *key > after);
        }

        Ok(Self::page(rows, limit))
    }
}
