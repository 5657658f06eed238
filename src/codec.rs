//! Stored document encoding and dotted-path access into decoded documents.

use serde_json::Value;

use crate::error::Result;

/// A decoded stored document.
pub type Document = serde_json::Map<String, Value>;

/// Turns stored documents into bytes for the `_doc` field and back.
pub trait DocumentCodec: Send + Sync + std::fmt::Debug {
    fn encode(&self, document: &Document) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Document>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl DocumentCodec for JsonCodec {
    fn encode(&self, document: &Document) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(document)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Document> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Every value reachable at a dotted path.
///
/// Arrays met along the way fan out, and arrays at the end are flattened,
/// so `authors.name` on `{"authors": [{"name": "a"}, {"name": "b"}]}`
/// yields both names.
pub fn values_at_path<'a>(
    document: &'a Document,
    path: &str,
) -> Vec<&'a Value> {
    let mut out = Vec::new();
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    if let Some(value) = document.get(head) {
        collect_values(value, rest, &mut out);
    }
    out
}

fn collect_values<'a>(
    value: &'a Value,
    rest: Option<&str>,
    out: &mut Vec<&'a Value>,
) {
    match (value, rest) {
        (Value::Array(items), _) => {
            for item in items {
                collect_values(item, rest, out);
            }
        }
        (Value::Null, None) => {}
        (_, None) => out.push(value),
        (Value::Object(inner), Some(rest)) => {
            out.extend(values_at_path(inner, rest));
        }
        (_, Some(_)) => {}
    }
}

/// Text form of a scalar value. Objects and nulls have none.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Keep only the given dotted paths (and their parents).
pub fn retain_fields(document: &mut Document, paths: &[String]) {
    let paths: Vec<&str> = paths.iter().map(String::as_str).collect();
    retain_paths(document, &paths);
}

fn retain_paths(document: &mut Document, paths: &[&str]) {
    document.retain(|key, value| {
        if paths.contains(&key.as_str()) {
            return true;
        }
        let prefix = format!("{key}.");
        let nested: Vec<&str> = paths
            .iter()
            .filter_map(|p| p.strip_prefix(prefix.as_str()))
            .collect();
        if nested.is_empty() {
            return false;
        }
        match value {
            Value::Object(inner) => {
                retain_paths(inner, &nested);
                !inner.is_empty()
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if let Value::Object(inner) = item {
                        retain_paths(inner, &nested);
                    }
                }
                true
            }
            _ => false,
        }
    });
}

/// Remove the given dotted paths.
pub fn remove_fields(document: &mut Document, paths: &[String]) {
    for path in paths {
        remove_path(document, path);
    }
}

fn remove_path(document: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            document.remove(path);
        }
        Some((head, rest)) => match document.get_mut(head) {
            Some(Value::Object(inner)) => remove_path(inner, rest),
            Some(Value::Array(items)) => {
                for item in items.iter_mut() {
                    if let Value::Object(inner) = item {
                        remove_path(inner, rest);
                    }
                }
            }
            _ => {}
        },
    }
}
