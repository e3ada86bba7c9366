use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tenant identifier as handed to the store, including the optional
/// leading shared-storage marker.
pub type TenantId = String;
/// Record identifier, unique within a tenant.
pub type RecordId = String;

/// Leading character on a tenant id that routes it to shared storage.
pub const SHARED_MARKER: char = ' ';

/// Version value reported back to the caller when an optimistic-lock write
/// was rejected.
pub const VERSION_CONFLICT: i64 = -1;

/// A typed, tenant-scoped record.
///
/// Core attributes are fields; everything else lives in `properties`, which
/// keeps insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub id: RecordId,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub appid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parentid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creatorid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, Value>,
}

impl Record {
    pub fn new(kind: impl Into<String>) -> Self {
        Record {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parentid: impl Into<String>) -> Self {
        self.parentid = Some(parentid.into());
        self
    }

    pub fn with_creator(mut self, creatorid: impl Into<String>) -> Self {
        self.creatorid = Some(creatorid.into());
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn has_id(&self) -> bool {
        !self.id.trim().is_empty()
    }

    /// Optimistic locking applies only to positive versions.
    pub fn is_locked(&self) -> bool {
        self.version.map(|v| v > 0).unwrap_or(false)
    }

    pub fn is_conflicted(&self) -> bool {
        self.version == Some(VERSION_CONFLICT)
    }

    /// Parses the `latlng` property (`"lat,lng"`) used by location records.
    pub fn lat_lng(&self) -> Option<(f64, f64)> {
        let raw = self.properties.get("latlng")?.as_str()?;
        let (lat, lng) = raw.split_once(',')?;
        let lat: f64 = lat.trim().parse().ok()?;
        let lng: f64 = lng.trim().parse().ok()?;
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return None;
        }
        Some((lat, lng))
    }

    /// Value of a core attribute or property by name, as JSON.
    pub fn get_value(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::String(self.id.clone())),
            "type" => Some(Value::String(self.kind.clone())),
            "appid" => Some(Value::String(self.appid.clone())),
            "name" => self.name.clone().map(Value::String),
            "parentid" => self.parentid.clone().map(Value::String),
            "creatorid" => self.creatorid.clone().map(Value::String),
            "timestamp" => self.timestamp.map(Value::from),
            "updated" => self.updated.map(Value::from),
            "version" => self.version.map(Value::from),
            "tags" => Some(Value::from(self.tags.clone())),
            other => self.properties.get(other).cloned(),
        }
    }

    /// Assigns an id and creation timestamp where absent and stamps the
    /// tenant. Called by every adapter before the first write.
    pub fn stamp_for_create(&mut self, tenant_name: &str, now_ms: i64) {
        if !self.has_id() {
            self.id = new_record_id();
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(now_ms);
        }
        self.appid = tenant_name.to_string();
        if !self.is_locked() {
            self.version = None;
        }
    }
}

pub fn new_record_id() -> RecordId {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Tenant descriptor handed to lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub shared_table: bool,
    pub shared_index: bool,
}

impl Tenant {
    /// Derives both sharing flags from the leading marker on `id`.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let shared = is_shared_tenant(&id);
        Tenant {
            id,
            shared_table: shared,
            shared_index: shared,
        }
    }

    pub fn shared(name: &str) -> Self {
        Tenant::new(format!("{}{}", SHARED_MARKER, name.trim()))
    }

    /// Logical tenant name, with the routing marker stripped.
    pub fn name(&self) -> &str {
        self.id.trim()
    }
}

pub fn is_shared_tenant(tenant_id: &str) -> bool {
    tenant_id.starts_with(SHARED_MARKER) && !tenant_id.trim().is_empty()
}

/// Pagination cursor shared by scans and searches.
///
/// `last_key` is opaque and backend-specific. `count` is written by the
/// component serving the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pager {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default)]
    pub limit: usize,
    #[serde(rename = "sort", default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default = "default_desc")]
    pub desc: bool,
    #[serde(rename = "lastKey", default, skip_serializing_if = "Option::is_none")]
    pub last_key: Option<String>,
    #[serde(default)]
    pub count: u64,
}

fn default_page() -> u64 {
    1
}

fn default_desc() -> bool {
    true
}

impl Default for Pager {
    fn default() -> Self {
        Pager {
            page: 1,
            limit: 0,
            sort_by: None,
            desc: true,
            last_key: None,
            count: 0,
        }
    }
}

impl Pager {
    pub fn new(limit: usize) -> Self {
        Pager {
            limit,
            ..Default::default()
        }
    }

    pub fn with_page(mut self, page: u64) -> Self {
        self.page = page.max(1);
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>, desc: bool) -> Self {
        self.sort_by = Some(field.into());
        self.desc = desc;
        self
    }

    /// Zero-based offset of the current page for offset-paged backends.
    pub fn offset(&self, limit: usize) -> usize {
        (self.page.max(1) as usize - 1).saturating_mul(limit)
    }

    /// Records that a scan page was served and where the next one starts.
    pub fn advance(&mut self, served: usize, last_key: Option<String>) {
        if served > 0 {
            self.page += 1;
            self.count += served as u64;
            self.last_key = last_key;
        }
    }

    /// Like [`Pager::advance`] for a page where only `served` of the
    /// `scanned` rows were returned. The cursor still moves past all of them.
    pub fn advance_past(&mut self, scanned: usize, served: usize, last_key: Option<String>) {
        if scanned > 0 {
            self.page += 1;
            self.count += served as u64;
            self.last_key = last_key;
        }
    }
}
