//! Builds tantivy queries from search operations.
//!
//! Equality, prefix, wildcard and list matches run against the exact
//! `field=value` tokens in `_kv`. Comparison markers become range queries on
//! `_json_filter`, written in query-parser syntax. Free text goes through the
//! query parser over `name` and `_all`; text that does not parse degrades to
//! match-all.

use crate::error::{Result, ShortstackError};
use crate::search::document::scalar_strings;
use crate::search::schema::{exact_token, IndexFields, EXACT_SEPARATOR, FILTER};
use indexmap::IndexMap;
use serde_json::Value;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, RegexQuery, TermQuery};
use tantivy::schema::{Field, IndexRecordOption};
use tantivy::tokenizer::TokenStream;
use tantivy::{Index, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Splits a trailing comparison marker off a term key: `"price>="` becomes
/// `("price", Some(Gte))`.
pub fn split_comparison(key: &str) -> (&str, Option<Comparison>) {
    let trimmed = key.trim_end();
    for (marker, op) in [
        (">=", Comparison::Gte),
        ("<=", Comparison::Lte),
        (">", Comparison::Gt),
        ("<", Comparison::Lt),
    ] {
        if let Some(field) = trimmed.strip_suffix(marker) {
            let field = field.trim_end();
            if !field.is_empty() {
                return (field, Some(op));
            }
        }
    }
    (trimmed, None)
}

/// Range expression in query-parser syntax. Strict bounds on integers are
/// rewritten as inclusive ones.
pub fn range_expression(field: &str, op: Comparison, value: &Value) -> Option<String> {
    let path = format!("{}.{}", FILTER, field);
    if let Some(i) = value.as_i64() {
        return Some(match op {
            Comparison::Gt => format!("{}:[{} TO *]", path, i.saturating_add(1)),
            Comparison::Gte => format!("{}:[{} TO *]", path, i),
            Comparison::Lt => format!("{}:[* TO {}]", path, i.saturating_sub(1)),
            Comparison::Lte => format!("{}:[* TO {}]", path, i),
        });
    }
    let bound = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) if !s.is_empty() => quote_bound(s),
        _ => return None,
    };
    Some(match op {
        Comparison::Gt => format!("{}:{{{} TO *}}", path, bound),
        Comparison::Gte => format!("{}:[{} TO *]", path, bound),
        Comparison::Lt => format!("{}:[* TO {}}}", path, bound),
        Comparison::Lte => format!("{}:[* TO {}]", path, bound),
    })
}

fn quote_bound(s: &str) -> String {
    if s.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.') {
        s.to_string()
    } else {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// Anchored regex for a `*`/`?` wildcard pattern on one field.
pub fn wildcard_regex(field: &str, pattern: &str) -> String {
    let mut regex = regex::escape(&format!("{}{}", field, EXACT_SEPARATOR));
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex
}

pub struct Translator<'a> {
    index: &'a Index,
    fields: &'a IndexFields,
}

impl<'a> Translator<'a> {
    pub fn new(index: &'a Index, fields: &'a IndexFields) -> Self {
        Translator { index, fields }
    }

    fn text_term(field: Field, text: &str) -> Box<dyn Query> {
        Box::new(TermQuery::new(
            Term::from_field_text(field, text),
            IndexRecordOption::Basic,
        ))
    }

    /// Restricts a clause to one tenant and, optionally, one type.
    pub fn scoped(&self, appid: &str, kind: Option<&str>, clause: Box<dyn Query>) -> Box<dyn Query> {
        let mut clauses = vec![(Occur::Must, Self::text_term(self.fields.appid, appid))];
        if let Some(kind) = kind.filter(|k| !k.trim().is_empty()) {
            clauses.push((Occur::Must, Self::text_term(self.fields.kind, kind)));
        }
        clauses.push((Occur::Must, clause));
        Box::new(BooleanQuery::new(clauses))
    }

    /// Equality on a field. Array values match any element.
    pub fn term(&self, field: &str, value: &Value) -> Option<Box<dyn Query>> {
        let tokens = scalar_strings(value);
        match tokens.len() {
            0 => None,
            1 => Some(Self::text_term(self.fields.exact, &exact_token(field, &tokens[0]))),
            _ => Some(Box::new(BooleanQuery::new(
                tokens
                    .iter()
                    .map(|t| (Occur::Should, Self::text_term(self.fields.exact, &exact_token(field, t))))
                    .collect(),
            ))),
        }
    }

    pub fn range(&self, field: &str, op: Comparison, value: &Value) -> Result<Box<dyn Query>> {
        let expr = range_expression(field, op, value).ok_or_else(|| {
            ShortstackError::InvalidQuery(format!("range on '{}' needs a number or string", field))
        })?;
        let parser = QueryParser::for_index(self.index, vec![self.fields.filter]);
        Ok(parser.parse_query(&expr)?)
    }

    /// Conjunction (`match_all`) or disjunction of equality and range
    /// clauses. `None` when no clause could be built.
    pub fn terms(&self, terms: &IndexMap<String, Value>, match_all: bool) -> Option<Box<dyn Query>> {
        let occur = if match_all { Occur::Must } else { Occur::Should };
        let mut clauses = Vec::new();
        for (key, value) in terms {
            let (field, op) = split_comparison(key);
            if field.is_empty() {
                continue;
            }
            let clause = match op {
                Some(op) => match self.range(field, op, value) {
                    Ok(q) => Some(q),
                    Err(e) => {
                        tracing::warn!("[SEARCH] skipping range on {}: {}", field, e);
                        None
                    }
                },
                None => self.term(field, value),
            };
            if let Some(clause) = clause {
                clauses.push((occur, clause));
            }
        }
        if clauses.is_empty() {
            None
        } else {
            Some(Box::new(BooleanQuery::new(clauses)))
        }
    }

    pub fn prefix(&self, field: &str, prefix: &str) -> Result<Box<dyn Query>> {
        let pattern = format!("{}.*", regex::escape(&exact_token(field, prefix)));
        Ok(Box::new(RegexQuery::from_pattern(&pattern, self.fields.exact)?))
    }

    pub fn wildcard(&self, field: &str, pattern: &str) -> Result<Box<dyn Query>> {
        Ok(Box::new(RegexQuery::from_pattern(
            &wildcard_regex(field, pattern),
            self.fields.exact,
        )?))
    }

    /// Any of `values` on `field`.
    pub fn term_in_list(&self, field: &str, values: &[Value]) -> Option<Box<dyn Query>> {
        let clauses: Vec<(Occur, Box<dyn Query>)> = values
            .iter()
            .flat_map(scalar_strings)
            .map(|v| (Occur::Should, Self::text_term(self.fields.exact, &exact_token(field, &v))))
            .collect();
        if clauses.is_empty() {
            None
        } else {
            Some(Box::new(BooleanQuery::new(clauses)))
        }
    }

    /// Records carrying every one of `tags`.
    pub fn tagged(&self, tags: &[String]) -> Option<Box<dyn Query>> {
        let clauses: Vec<(Occur, Box<dyn Query>)> = tags
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| (Occur::Must, Self::text_term(self.fields.exact, &exact_token("tags", t))))
            .collect();
        if clauses.is_empty() {
            None
        } else {
            Some(Box::new(BooleanQuery::new(clauses)))
        }
    }

    pub fn ids(&self, ids: &[String]) -> Option<Box<dyn Query>> {
        let clauses: Vec<(Occur, Box<dyn Query>)> = ids
            .iter()
            .filter(|id| !id.trim().is_empty())
            .map(|id| (Occur::Should, Self::text_term(self.fields.id, id)))
            .collect();
        if clauses.is_empty() {
            None
        } else {
            Some(Box::new(BooleanQuery::new(clauses)))
        }
    }

    pub fn key(&self, key: &str) -> Box<dyn Query> {
        Self::text_term(self.fields.key, key)
    }

    pub fn free_text(&self, query: &str) -> Box<dyn Query> {
        let query = query.trim();
        if query.is_empty() || query == "*" {
            return Box::new(AllQuery);
        }
        let parser = QueryParser::for_index(self.index, vec![self.fields.name, self.fields.all]);
        match parser.parse_query(query) {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!("[SEARCH] invalid query {:?}, matching all: {}", query, e);
                Box::new(AllQuery)
            }
        }
    }

    /// More-like-this: any analyzed token of `like_text` on any of `fields`,
    /// never the record keyed `exclude_key`.
    pub fn similar(&self, exclude_key: &str, fields: &[String], like_text: &str) -> Option<Box<dyn Query>> {
        let tokens = self.analyze(like_text);
        if tokens.is_empty() {
            return None;
        }
        let json_parser = QueryParser::for_index(self.index, vec![]);
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        let targets: Vec<&str> = if fields.is_empty() {
            vec!["_all"]
        } else {
            fields.iter().map(String::as_str).collect()
        };
        for target in targets {
            for token in &tokens {
                let clause = match target {
                    "name" => Some(Self::text_term(self.fields.name, token)),
                    "_all" => Some(Self::text_term(self.fields.all, token)),
                    field => json_parser
                        .parse_query(&format!("properties.{}:{}", field, token))
                        .ok(),
                };
                if let Some(clause) = clause {
                    clauses.push((Occur::Should, clause));
                }
            }
        }
        if clauses.is_empty() {
            return None;
        }
        clauses.push((Occur::MustNot, self.key(exclude_key)));
        Some(Box::new(BooleanQuery::new(clauses)))
    }

    fn analyze(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let Ok(mut analyzer) = self.index.tokenizer_for_field(self.fields.all) else {
            return tokens;
        };
        let mut stream = analyzer.token_stream(text);
        while stream.advance() {
            let token = stream.token().text.clone();
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_comparison() {
        assert_eq!(split_comparison("price>="), ("price", Some(Comparison::Gte)));
        assert_eq!(split_comparison("price >"), ("price", Some(Comparison::Gt)));
        assert_eq!(split_comparison("age<"), ("age", Some(Comparison::Lt)));
        assert_eq!(split_comparison("age<="), ("age", Some(Comparison::Lte)));
        assert_eq!(split_comparison("color"), ("color", None));
        assert_eq!(split_comparison(">"), (">", None));
    }

    #[test]
    fn test_range_expression() {
        assert_eq!(
            range_expression("price", Comparison::Gte, &json!(10)).unwrap(),
            "_json_filter.price:[10 TO *]"
        );
        assert_eq!(
            range_expression("price", Comparison::Gt, &json!(10)).unwrap(),
            "_json_filter.price:[11 TO *]"
        );
        assert_eq!(
            range_expression("price", Comparison::Lt, &json!(10)).unwrap(),
            "_json_filter.price:[* TO 9]"
        );
        assert_eq!(
            range_expression("price", Comparison::Gt, &json!(1.5)).unwrap(),
            "_json_filter.price:{1.5 TO *}"
        );
        assert_eq!(
            range_expression("price", Comparison::Lt, &json!(2.5)).unwrap(),
            "_json_filter.price:[* TO 2.5}"
        );
        assert!(range_expression("price", Comparison::Lt, &json!(null)).is_none());
        assert_eq!(
            range_expression("city", Comparison::Lte, &json!("new york")).unwrap(),
            "_json_filter.city:[* TO \"new york\"]"
        );
    }

    #[test]
    fn test_wildcard_regex() {
        assert_eq!(wildcard_regex("name", "jo*n?"), "name=jo.*n.");
        assert_eq!(wildcard_regex("v", "a.b*"), "v=a\\.b.*");
    }
}
