//! One physical tantivy index with its single writer.
//!
//! Writes commit and reload before returning, so a document is searchable as
//! soon as the call that indexed it completes.

use crate::error::{Result, ShortstackError};
use crate::search::document;
use crate::search::schema::{build_schema, doc_key, IndexFields};
use crate::types::Record;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tantivy::collector::Count;
use tantivy::query::TermQuery;
use tantivy::schema::IndexRecordOption;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, Term};

pub struct SearchIndex {
    name: String,
    path: PathBuf,
    inner: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: IndexFields,
}

impl SearchIndex {
    pub const DEFAULT_BUFFER_SIZE: usize = 20_000_000;

    pub fn create<P: AsRef<Path>>(name: &str, path: P) -> Result<Self> {
        std::fs::create_dir_all(path.as_ref())?;
        let inner = Index::create_in_dir(path.as_ref(), build_schema())?;
        Self::wrap(name, path.as_ref(), inner)
    }

    pub fn open<P: AsRef<Path>>(name: &str, path: P) -> Result<Self> {
        let inner = Index::open_in_dir(path.as_ref())?;
        Self::wrap(name, path.as_ref(), inner)
    }

    /// Whether a committed index lives at `path`.
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().join("meta.json").exists()
    }

    pub fn open_or_create<P: AsRef<Path>>(name: &str, path: P) -> Result<Self> {
        if Self::exists(path.as_ref()) {
            Self::open(name, path)
        } else {
            Self::create(name, path)
        }
    }

    fn wrap(name: &str, path: &Path, inner: Index) -> Result<Self> {
        let fields = IndexFields::from_schema(&inner.schema())?;
        let reader = inner
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = inner.writer_with_num_threads(1, Self::DEFAULT_BUFFER_SIZE)?;
        Ok(SearchIndex {
            name: name.to_string(),
            path: path.to_path_buf(),
            inner,
            reader,
            writer: Mutex::new(writer),
            fields,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inner(&self) -> &Index {
        &self.inner
    }

    pub fn fields(&self) -> &IndexFields {
        &self.fields
    }

    pub fn searcher(&self) -> Searcher {
        self.reader.searcher()
    }

    fn with_writer<T>(&self, f: impl FnOnce(&mut IndexWriter) -> Result<T>) -> Result<T> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ShortstackError::Backend(format!("index writer for {} poisoned", self.name)))?;
        f(&mut writer)
    }

    /// Replaces the documents for `records` without committing.
    pub fn stage(&self, records: &[Record]) -> Result<()> {
        let fields = self.fields;
        self.with_writer(|writer| {
            for record in records {
                let doc = document::to_document(&fields, record)?;
                let key = doc_key(&record.appid, &record.id);
                writer.delete_term(Term::from_field_text(fields.key, &key));
                writer.add_document(doc)?;
            }
            Ok(())
        })
    }

    /// Commits staged changes and makes them visible to new searchers.
    pub fn commit(&self) -> Result<()> {
        self.with_writer(|writer| {
            writer.commit()?;
            Ok(())
        })?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn upsert(&self, records: &[Record]) -> Result<()> {
        self.stage(records)?;
        self.commit()
    }

    pub fn delete_keys(&self, keys: &[String]) -> Result<()> {
        let key_field = self.fields.key;
        self.with_writer(|writer| {
            for key in keys {
                writer.delete_term(Term::from_field_text(key_field, key));
            }
            Ok(())
        })?;
        self.commit()
    }

    /// Removes every document of one tenant from a shared index. Returns the
    /// number of documents removed.
    pub fn delete_partition(&self, appid: &str) -> Result<usize> {
        let term = Term::from_field_text(self.fields.appid, appid);
        let count = self
            .searcher()
            .search(&TermQuery::new(term.clone(), IndexRecordOption::Basic), &Count)?;
        self.with_writer(|writer| {
            writer.delete_term(term);
            Ok(())
        })?;
        self.commit()?;
        Ok(count)
    }

    pub fn num_docs(&self) -> u64 {
        self.searcher().num_docs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(appid: &str, id: &str) -> Record {
        let mut r = Record::new("note").with_id(id).with_name("hello");
        r.appid = appid.into();
        r
    }

    #[test]
    fn test_upsert_replaces_by_key() {
        let dir = TempDir::new().unwrap();
        let index = SearchIndex::create("t", dir.path()).unwrap();
        index.upsert(&[record("a", "1"), record("a", "2")]).unwrap();
        index.upsert(&[record("a", "1")]).unwrap();
        assert_eq!(index.num_docs(), 2);
    }

    #[test]
    fn test_delete_partition_leaves_other_tenants() {
        let dir = TempDir::new().unwrap();
        let index = SearchIndex::create("shared", dir.path()).unwrap();
        index
            .upsert(&[record("a", "1"), record("a", "2"), record("b", "1")])
            .unwrap();
        assert_eq!(index.delete_partition("a").unwrap(), 2);
        assert_eq!(index.num_docs(), 1);
    }

    #[test]
    fn test_reopen_after_drop() {
        let dir = TempDir::new().unwrap();
        {
            let index = SearchIndex::create("t", dir.path()).unwrap();
            index.upsert(&[record("a", "1")]).unwrap();
        }
        assert!(SearchIndex::exists(dir.path()));
        let index = SearchIndex::open_or_create("t", dir.path()).unwrap();
        assert_eq!(index.num_docs(), 1);
    }
}
