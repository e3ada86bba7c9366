//! Record <-> flat row conversion for backends that store string attributes.
//!
//! A row always carries the physical key attribute [`KEY_ATTR`]. Optional
//! values that are absent are omitted rather than written as empty strings.
//! `tags` and `properties` are JSON-encoded.

use crate::error::{Result, ShortstackError};
use crate::types::Record;
use indexmap::IndexMap;
use serde_json::Value;

/// Flat attribute map, in write order.
pub type Row = IndexMap<String, String>;

/// Synthetic physical key attribute. Reserved.
pub const KEY_ATTR: &str = "key";

/// Core attributes returned when a read skips the property bag.
pub const CORE_ATTRS: &[&str] = &[
    KEY_ATTR,
    "id",
    "type",
    "appid",
    "name",
    "parentid",
    "creatorid",
    "timestamp",
    "updated",
    "version",
    "tags",
];

/// Attributes an update must never overwrite.
pub const LOCKED_ON_UPDATE: &[&str] = &["id", "type", "appid", "timestamp", "creatorid"];

/// Encodes a record as a row keyed by `key`.
///
/// `version` is written only when the record is lock-active. Attributes in
/// `exclude` are left out, which is how updates protect immutable fields.
pub fn to_row(record: &Record, key: &str, exclude: &[&str]) -> Result<Row> {
    if record.properties.contains_key(KEY_ATTR) {
        return Err(ShortstackError::InvalidRecord(format!(
            "property name '{}' is reserved",
            KEY_ATTR
        )));
    }

    let mut row = Row::new();
    row.insert(KEY_ATTR.to_string(), key.to_string());

    let mut put = |name: &str, value: Option<String>| {
        if exclude.contains(&name) {
            return;
        }
        if let Some(v) = value {
            row.insert(name.to_string(), v);
        }
    };

    put("id", non_empty(&record.id));
    put("type", non_empty(&record.kind));
    put("appid", non_empty(&record.appid));
    put("name", record.name.clone());
    put("parentid", record.parentid.clone());
    put("creatorid", record.creatorid.clone());
    put("timestamp", record.timestamp.map(|t| t.to_string()));
    put("updated", record.updated.map(|t| t.to_string()));
    if record.is_locked() {
        put("version", record.version.map(|v| v.to_string()));
    }
    if !record.tags.is_empty() {
        put("tags", Some(serde_json::to_string(&record.tags)?));
    }
    if !record.properties.is_empty() {
        put("properties", Some(serde_json::to_string(&record.properties)?));
    }

    Ok(row)
}

/// Decodes a row. The physical key is dropped; unknown attributes are
/// folded into `properties` so rows written by other tools stay readable.
pub fn from_row(row: &Row) -> Result<Record> {
    let mut record = Record::default();

    for (name, value) in row {
        match name.as_str() {
            KEY_ATTR => {}
            "id" => record.id = value.clone(),
            "type" => record.kind = value.clone(),
            "appid" => record.appid = value.clone(),
            "name" => record.name = Some(value.clone()),
            "parentid" => record.parentid = Some(value.clone()),
            "creatorid" => record.creatorid = Some(value.clone()),
            "timestamp" => record.timestamp = Some(parse_i64(name, value)?),
            "updated" => record.updated = Some(parse_i64(name, value)?),
            "version" => record.version = Some(parse_i64(name, value)?),
            "tags" => record.tags = serde_json::from_str(value)?,
            "properties" => {
                let props: IndexMap<String, Value> = serde_json::from_str(value)?;
                for (k, v) in props {
                    record.properties.entry(k).or_insert(v);
                }
            }
            other => {
                record
                    .properties
                    .insert(other.to_string(), Value::String(value.clone()));
            }
        }
    }

    if record.id.is_empty() {
        return Err(ShortstackError::MissingField("id".to_string()));
    }
    Ok(record)
}

/// Keeps only the core attributes of a row.
pub fn project_core(row: Row) -> Row {
    row.into_iter()
        .filter(|(name, _)| CORE_ATTRS.contains(&name.as_str()))
        .collect()
}

/// Merges update attributes into a stored row, leaving protected attributes
/// untouched. Optional attributes missing from `update` are removed.
pub fn merge_update(stored: &Row, update: &Row) -> Row {
    let mut merged = Row::new();
    for (name, value) in stored {
        if name == KEY_ATTR || LOCKED_ON_UPDATE.contains(&name.as_str()) {
            merged.insert(name.clone(), value.clone());
        }
    }
    for (name, value) in update {
        if !merged.contains_key(name) || name == KEY_ATTR {
            merged.insert(name.clone(), value.clone());
        }
    }
    merged
}

/// Merge for an unlocked update: protected attributes and the stored
/// `version` both survive.
pub fn merge_unlocked(stored: &Row, update: &Row) -> Row {
    let mut merged = merge_update(stored, update);
    if let Some(v) = stored.get("version") {
        merged
            .entry("version".to_string())
            .or_insert_with(|| v.clone());
    }
    merged
}

pub fn stored_version(row: &Row) -> i64 {
    row.get("version")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn parse_i64(name: &str, value: &str) -> Result<i64> {
    value.parse().map_err(|_| {
        ShortstackError::InvalidRecord(format!("attribute '{}' is not an integer: {}", name, value))
    })
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
