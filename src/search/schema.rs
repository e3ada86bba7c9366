//! Physical index layout.
//!
//! Every index, dedicated or shared, uses the same schema. Documents are keyed
//! by `_key` (`appid` + `_` + `id`) so one physical index can hold many
//! tenants without id collisions.

use crate::error::{Result, ShortstackError};
use tantivy::schema::{
    Field, IndexRecordOption, JsonObjectOptions, NumericOptions, Schema, TextFieldIndexing,
    FAST, INDEXED, STORED, STRING, TEXT,
};

pub const KEY: &str = "_key";
pub const ID: &str = "id";
pub const APPID: &str = "appid";
pub const TYPE: &str = "type";
pub const PARENTID: &str = "parentid";
pub const NAME: &str = "name";
pub const ALL: &str = "_all";
pub const PROPERTIES: &str = "properties";
pub const EXACT: &str = "_kv";
pub const FILTER: &str = "_json_filter";
pub const TIMESTAMP: &str = "timestamp";
pub const UPDATED: &str = "updated";
pub const GEO_LAT: &str = "_geo_lat";
pub const GEO_LNG: &str = "_geo_lng";
pub const SOURCE: &str = "_source";

/// Separator between field name and value in `_kv` tokens.
pub const EXACT_SEPARATOR: char = '=';

pub fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field(KEY, STRING | STORED | FAST);
    builder.add_text_field(ID, STRING | STORED);
    builder.add_text_field(APPID, STRING);
    builder.add_text_field(TYPE, STRING);
    builder.add_text_field(PARENTID, STRING);
    builder.add_text_field(NAME, TEXT);
    builder.add_text_field(ALL, TEXT);

    let properties_indexing = TextFieldIndexing::default()
        .set_tokenizer("default")
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    builder.add_json_field(
        PROPERTIES,
        JsonObjectOptions::default().set_indexing_options(properties_indexing),
    );

    // Exact "field=value" tokens for term, prefix, wildcard and list matches.
    builder.add_text_field(EXACT, STRING);

    let filter_indexing = TextFieldIndexing::default()
        .set_tokenizer("raw")
        .set_index_option(IndexRecordOption::Basic);
    builder.add_json_field(
        FILTER,
        JsonObjectOptions::default()
            .set_indexing_options(filter_indexing)
            .set_fast(None),
    );

    builder.add_i64_field(TIMESTAMP, INDEXED | STORED | FAST);
    builder.add_i64_field(UPDATED, INDEXED | STORED | FAST);

    let geo_opts = NumericOptions::default().set_fast().set_stored();
    builder.add_f64_field(GEO_LAT, geo_opts.clone());
    builder.add_f64_field(GEO_LNG, geo_opts);

    builder.add_text_field(SOURCE, STORED);

    builder.build()
}

/// Resolved field handles for one index.
#[derive(Debug, Clone, Copy)]
pub struct IndexFields {
    pub key: Field,
    pub id: Field,
    pub appid: Field,
    pub kind: Field,
    pub parentid: Field,
    pub name: Field,
    pub all: Field,
    pub properties: Field,
    pub exact: Field,
    pub filter: Field,
    pub timestamp: Field,
    pub updated: Field,
    pub geo_lat: Field,
    pub geo_lng: Field,
    pub source: Field,
}

impl IndexFields {
    pub fn from_schema(schema: &Schema) -> Result<Self> {
        let get = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| ShortstackError::MissingField(name.to_string()))
        };
        Ok(IndexFields {
            key: get(KEY)?,
            id: get(ID)?,
            appid: get(APPID)?,
            kind: get(TYPE)?,
            parentid: get(PARENTID)?,
            name: get(NAME)?,
            all: get(ALL)?,
            properties: get(PROPERTIES)?,
            exact: get(EXACT)?,
            filter: get(FILTER)?,
            timestamp: get(TIMESTAMP)?,
            updated: get(UPDATED)?,
            geo_lat: get(GEO_LAT)?,
            geo_lng: get(GEO_LNG)?,
            source: get(SOURCE)?,
        })
    }
}

/// Unique document key within a physical index.
pub fn doc_key(appid: &str, id: &str) -> String {
    format!("{}{}{}", appid, crate::tenancy::SHARED_KEY_SEPARATOR, id)
}

/// `_kv` token for a field/value pair.
pub fn exact_token(field: &str, value: &str) -> String {
    format!("{}{}{}", field, EXACT_SEPARATOR, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_resolves_all_fields() {
        let schema = build_schema();
        let fields = IndexFields::from_schema(&schema).unwrap();
        assert_ne!(fields.key, fields.id);
        assert!(schema.get_field_entry(fields.timestamp).is_fast());
        assert!(schema.get_field_entry(fields.key).is_stored());
    }

    #[test]
    fn test_key_and_token_format() {
        assert_eq!(doc_key("acme", "42"), "acme_42");
        assert_eq!(exact_token("color", "red"), "color=red");
    }
}
