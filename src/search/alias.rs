//! Alias table mapping logical index names to physical index directories.
//!
//! A change is first written to `aliases.json` through a temp file and
//! rename, and only then applied in memory, both under the table's write
//! lock. A failed write leaves the table as it was.

use crate::error::{Result, ShortstackError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub const ALIAS_FILE: &str = "aliases.json";

#[derive(Debug)]
pub struct AliasTable {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl AliasTable {
    /// Loads the table from `dir/aliases.json`, starting empty when the file
    /// does not exist yet.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(ALIAS_FILE);
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };
        Ok(AliasTable {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn resolve(&self, alias: &str) -> Option<String> {
        self.read().get(alias).cloned()
    }

    /// Points `alias` at `physical` and persists. Returns the previous target.
    pub fn swap(&self, alias: &str, physical: &str) -> Result<Option<String>> {
        let mut entries = self.write()?;
        let mut next = entries.clone();
        let previous = next.insert(alias.to_string(), physical.to_string());
        self.persist(&next)?;
        *entries = next;
        drop(entries);
        tracing::info!("[ALIAS] {} -> {} (was {:?})", alias, physical, previous);
        Ok(previous)
    }

    pub fn remove(&self, alias: &str) -> Result<Option<String>> {
        let mut entries = self.write()?;
        if !entries.contains_key(alias) {
            return Ok(None);
        }
        let mut next = entries.clone();
        let previous = next.remove(alias);
        self.persist(&next)?;
        *entries = next;
        Ok(previous)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, String>>> {
        self.entries
            .write()
            .map_err(|_| ShortstackError::Backend("alias table lock poisoned".to_string()))
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
