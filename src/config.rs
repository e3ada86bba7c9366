use crate::error::{Result, ShortstackError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard per-call limits of the wide-column service. Configured chunk sizes
/// are clamped to these.
pub const MAX_WRITE_BATCH: usize = 25;
pub const MAX_READ_BATCH: usize = 100;

/// Which storage adapter backs the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Wide-column table service (dedicated or shared tables).
    Table,
    /// Embedded SQLite database, key/JSON layout.
    Sqlite,
    /// Records live only in the search index.
    Index,
    /// In-process maps.
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Table => "table",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Index => "index",
            BackendKind::Memory => "memory",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ShortstackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "table" | "dynamodb" => Ok(BackendKind::Table),
            "sqlite" => Ok(BackendKind::Sqlite),
            "index" | "search" => Ok(BackendKind::Index),
            "memory" => Ok(BackendKind::Memory),
            other => Err(ShortstackError::Config(format!(
                "unknown backend '{}', expected one of table, sqlite, index, memory",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub data_dir: PathBuf,
    pub table_prefix: String,
    pub shared_table: String,
    pub index_prefix: String,
    pub shared_index: String,
    pub encryption_at_rest: bool,
    pub fail_on_write_error: bool,
    pub read_from_index: bool,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub write_batch_size: usize,
    pub read_batch_size: usize,
    pub retry_base_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub reindex_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: BackendKind::Sqlite,
            data_dir: PathBuf::from("./data"),
            table_prefix: "shortstack".to_string(),
            shared_table: "shortstack-shared".to_string(),
            index_prefix: "shortstack".to_string(),
            shared_index: "shortstack-shared".to_string(),
            encryption_at_rest: false,
            fail_on_write_error: true,
            read_from_index: true,
            default_page_size: 30,
            max_page_size: 100,
            write_batch_size: MAX_WRITE_BATCH,
            read_batch_size: MAX_READ_BATCH,
            retry_base_delay_ms: 1000,
            request_timeout_ms: 10_000,
            reindex_batch_size: 100,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}

impl StoreConfig {
    /// Load config from `SHORTSTACK_*` environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = StoreConfig::default();
        let data_dir = env::var("SHORTSTACK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        StoreConfig {
            backend: env_parse("SHORTSTACK_BACKEND", defaults.backend),
            data_dir,
            table_prefix: env::var("SHORTSTACK_TABLE_PREFIX").unwrap_or(defaults.table_prefix),
            shared_table: env::var("SHORTSTACK_SHARED_TABLE").unwrap_or(defaults.shared_table),
            index_prefix: env::var("SHORTSTACK_INDEX_PREFIX").unwrap_or(defaults.index_prefix),
            shared_index: env::var("SHORTSTACK_SHARED_INDEX").unwrap_or(defaults.shared_index),
            encryption_at_rest: env_flag(
                "SHORTSTACK_ENCRYPTION_AT_REST",
                defaults.encryption_at_rest,
            ),
            fail_on_write_error: env_flag(
                "SHORTSTACK_FAIL_ON_WRITE_ERROR",
                defaults.fail_on_write_error,
            ),
            read_from_index: env_flag("SHORTSTACK_READ_FROM_INDEX", defaults.read_from_index),
            default_page_size: env_parse("SHORTSTACK_DEFAULT_PAGE_SIZE", defaults.default_page_size),
            max_page_size: env_parse("SHORTSTACK_MAX_PAGE_SIZE", defaults.max_page_size),
            write_batch_size: env_parse("SHORTSTACK_WRITE_BATCH_SIZE", defaults.write_batch_size),
            read_batch_size: env_parse("SHORTSTACK_READ_BATCH_SIZE", defaults.read_batch_size),
            retry_base_delay_ms: env_parse(
                "SHORTSTACK_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            ),
            request_timeout_ms: env_parse(
                "SHORTSTACK_REQUEST_TIMEOUT_MS",
                defaults.request_timeout_ms,
            ),
            reindex_batch_size: env_parse(
                "SHORTSTACK_REINDEX_BATCH_SIZE",
                defaults.reindex_batch_size,
            ),
        }
    }

    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: StoreConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.shared_table.trim().is_empty() || self.shared_index.trim().is_empty() {
            return Err(ShortstackError::Config(
                "shared_table and shared_index must not be blank".to_string(),
            ));
        }
        if self.max_page_size == 0 {
            return Err(ShortstackError::Config(
                "max_page_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_data_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.data_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("indexes")
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("shortstack.db")
    }

    pub fn write_chunk(&self) -> usize {
        self.write_batch_size.clamp(1, MAX_WRITE_BATCH)
    }

    pub fn read_chunk(&self) -> usize {
        self.read_batch_size.clamp(1, MAX_READ_BATCH)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// 0 means "use the default"; anything else is clamped to `[1, max_page_size]`.
    pub fn page_limit(&self, requested: usize) -> usize {
        let requested = if requested == 0 {
            self.default_page_size
        } else {
            requested
        };
        requested.clamp(1, self.max_page_size.max(1))
    }
}
