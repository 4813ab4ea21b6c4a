//! One-shot decoding of metadata payloads.
//!
//! The remote metadata endpoints answer with a plain string, a JSON-encoded
//! string, or a JSON object depending on the field. Everything is decoded
//! here, once, into [`MetadataPayload`]; nothing downstream re-inspects shapes.

use serde_json::{Map, Value};
use std::fmt::{self, Display};

/// Which metadata lookup produced a payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    /// Display label of an entity.
    Label,
    /// Classification metadata (account type, sign convention, ...).
    Classification,
}

impl MetadataKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetadataKind::Label => "label",
            MetadataKind::Classification => "classification",
        }
    }
}

impl Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nested string encodings are unwrapped at most this many times.
const MAX_STRING_UNWRAP: usize = 2;

/// Fields consulted, in order, when a record needs a one-line rendering.
const TEXT_FIELDS: [&str; 5] = ["name", "label", "value", "type", "accttype"];

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataPayload {
    Empty,
    Text(String),
    Record(Map<String, Value>),
    List(Vec<MetadataPayload>),
}

impl MetadataPayload {
    /// Decode a raw payload.
    pub fn decode(raw: &str) -> Self {
        Self::decode_depth(raw, 0)
    }

    fn decode_depth(raw: &str, depth: usize) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return MetadataPayload::Empty;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::String(inner)) if depth < MAX_STRING_UNWRAP => {
                Self::decode_depth(&inner, depth + 1)
            }
            Ok(value) => Self::from_value(value),
            Err(_) => MetadataPayload::Text(trimmed.to_string()),
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => MetadataPayload::Empty,
            Value::String(s) if s.trim().is_empty() => MetadataPayload::Empty,
            Value::String(s) => MetadataPayload::Text(s.trim().to_string()),
            Value::Bool(b) => MetadataPayload::Text(b.to_string()),
            Value::Number(n) => MetadataPayload::Text(n.to_string()),
            Value::Array(items) => {
                MetadataPayload::List(items.into_iter().map(Self::from_value).collect())
            }
            Value::Object(map) => MetadataPayload::Record(map),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, MetadataPayload::Empty)
    }

    /// Best single-line text for display.
    pub fn display_text(&self) -> Option<String> {
        match self {
            MetadataPayload::Empty => None,
            MetadataPayload::Text(s) => Some(s.clone()),
            MetadataPayload::Record(map) => TEXT_FIELDS
                .iter()
                .find_map(|field| map.get(*field))
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                }),
            MetadataPayload::List(items) => items.iter().find_map(Self::display_text),
        }
    }

    /// Look up a field of a record payload.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            MetadataPayload::Record(map) => map.get(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_stays_text() {
        assert_eq!(
            MetadataPayload::decode("Accounts Receivable"),
            MetadataPayload::Text("Accounts Receivable".into())
        );
    }

    #[test]
    fn json_string_is_unwrapped() {
        assert_eq!(
            MetadataPayload::decode("\"Accounts Receivable\""),
            MetadataPayload::Text("Accounts Receivable".into())
        );
    }

    #[test]
    fn json_encoded_object_inside_a_string_becomes_a_record() {
        let raw = r#""{\"type\":\"AcctRec\",\"name\":\"AR\"}""#;
        let decoded = MetadataPayload::decode(raw);
        assert_eq!(decoded.display_text().as_deref(), Some("AR"));
        assert_eq!(decoded.field("type"), Some(&Value::String("AcctRec".into())));
    }

    #[test]
    fn blank_and_null_are_empty() {
        assert!(MetadataPayload::decode("   ").is_empty());
        assert!(MetadataPayload::decode("null").is_empty());
        assert!(MetadataPayload::decode("\"\"").is_empty());
    }

    #[test]
    fn numbers_render_as_text() {
        assert_eq!(
            MetadataPayload::decode("4000").display_text().as_deref(),
            Some("4000")
        );
    }
}
