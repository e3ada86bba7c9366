use crate::error::{Result, ShortstackError};
use crate::search::schema::{doc_key, exact_token, IndexFields};
use crate::types::Record;
use serde_json::Value;
use std::collections::BTreeMap;
use tantivy::schema::OwnedValue;
use tantivy::TantivyDocument;

/// Builds the tantivy document for a record.
///
/// The full record is kept as JSON in `_source` so hits can be materialized
/// without touching the object store.
pub fn to_document(fields: &IndexFields, record: &Record) -> Result<TantivyDocument> {
    if record.id.trim().is_empty() {
        return Err(ShortstackError::MissingField("id".to_string()));
    }
    let mut doc = TantivyDocument::new();

    doc.add_text(fields.key, doc_key(&record.appid, &record.id));
    doc.add_text(fields.id, &record.id);
    doc.add_text(fields.appid, &record.appid);
    doc.add_text(fields.kind, &record.kind);
    if let Some(parent) = &record.parentid {
        doc.add_text(fields.parentid, parent);
    }
    if let Some(name) = &record.name {
        doc.add_text(fields.name, name);
    }
    if let Some(ts) = record.timestamp {
        doc.add_i64(fields.timestamp, ts);
    }
    if let Some(ts) = record.updated {
        doc.add_i64(fields.updated, ts);
    }
    if let Some((lat, lng)) = record.lat_lng() {
        doc.add_f64(fields.geo_lat, lat);
        doc.add_f64(fields.geo_lng, lng);
    }

    let mut all_text = Vec::new();
    all_text.extend(record.name.iter().cloned());
    all_text.extend(record.tags.iter().cloned());
    for value in record.properties.values() {
        collect_text(value, &mut all_text);
    }
    if !all_text.is_empty() {
        doc.add_text(fields.all, all_text.join(" "));
    }

    let flat = flatten(record);
    for (field, value) in &flat {
        for token in scalar_strings(value) {
            doc.add_text(fields.exact, exact_token(field, &token));
        }
    }

    if !record.properties.is_empty() {
        let properties = record.properties.iter().map(|(k, v)| (k.clone(), v.clone()));
        doc.add_object(fields.properties, json_fields(properties));
    }
    doc.add_object(fields.filter, json_fields(flat));

    doc.add_text(fields.source, serde_json::to_string(record)?);
    Ok(doc)
}

/// Recovers the record stored in `_source`.
pub fn from_document(fields: &IndexFields, doc: &TantivyDocument) -> Result<Record> {
    let source = doc
        .get_first(fields.source)
        .and_then(|v| {
            let owned: OwnedValue = v.into();
            match owned {
                OwnedValue::Str(s) => Some(s),
                _ => None,
            }
        })
        .ok_or_else(|| ShortstackError::MissingField("_source".to_string()))?;
    Ok(serde_json::from_str(&source)?)
}

/// Core attributes plus properties as one flat map. Nested property objects
/// are addressed with dotted paths.
pub fn flatten(record: &Record) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for core in ["id", "type", "appid", "name", "parentid", "creatorid", "timestamp", "updated"] {
        if let Some(v) = record.get_value(core) {
            if !matches!(&v, Value::String(s) if s.is_empty()) {
                out.push((core.to_string(), v));
            }
        }
    }
    if !record.tags.is_empty() {
        out.push(("tags".to_string(), Value::from(record.tags.clone())));
    }
    for (key, value) in &record.properties {
        flatten_into(key, value, &mut out);
    }
    out
}

fn flatten_into(path: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(&format!("{}.{}", path, k), v, out);
            }
        }
        Value::Null => {}
        other => out.push((path.to_string(), other.clone())),
    }
}

/// Canonical string forms of a scalar, or of each scalar in an array.
pub fn scalar_strings(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Number(n) => vec![n.to_string()],
        Value::Bool(b) => vec![b.to_string()],
        Value::Array(items) => items
            .iter()
            .filter(|v| !v.is_array() && !v.is_object())
            .flat_map(scalar_strings)
            .collect(),
        _ => Vec::new(),
    }
}

fn collect_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, out)),
        _ => {}
    }
}

/// Object value for a JSON field. Numbers keep their JSON kind.
fn json_fields<I>(entries: I) -> BTreeMap<String, OwnedValue>
where
    I: IntoIterator<Item = (String, Value)>,
{
    entries
        .into_iter()
        .map(|(name, value)| (name, OwnedValue::from(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::schema::build_schema;
    use serde_json::json;

    fn record() -> Record {
        let mut r = Record::new("car")
            .with_id("c1")
            .with_name("Red Sedan")
            .with_tags(["fast", "red"])
            .with_property("color", json!("red"))
            .with_property("specs", json!({"doors": 4}));
        r.appid = "acme".into();
        r.timestamp = Some(1000);
        r
    }

    #[test]
    fn test_source_round_trip() {
        let fields = IndexFields::from_schema(&build_schema()).unwrap();
        let r = record();
        let doc = to_document(&fields, &r).unwrap();
        assert_eq!(from_document(&fields, &doc).unwrap(), r);
    }

    #[test]
    fn test_flatten_uses_dotted_paths() {
        let flat = flatten(&record());
        assert!(flat.contains(&("specs.doors".to_string(), json!(4))));
        assert!(flat.contains(&("appid".to_string(), json!("acme"))));
        assert!(flat.contains(&("tags".to_string(), json!(["fast", "red"]))));
    }

    #[test]
    fn test_scalar_strings() {
        assert_eq!(scalar_strings(&json!(["a", 1, true, {"x": 1}])), vec!["a", "1", "true"]);
        assert!(scalar_strings(&json!(null)).is_empty());
    }

    #[test]
    fn test_missing_id_rejected() {
        let fields = IndexFields::from_schema(&build_schema()).unwrap();
        assert!(to_document(&fields, &Record::new("car")).is_err());
    }
}
