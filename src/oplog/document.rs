use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::namespace::Namespace;
use crate::Timestamp;

/// A source document as returned by the replica set.
pub type Document = serde_json::Map<String, Value>;

/// Identity of a document within its namespace, taken from `_id`.
///
/// Strings and integers are used verbatim; extended-JSON object ids
/// (`{"$oid": "<24 hex chars>"}`) use the hex string. Any other `_id`
/// shape is a foreign identifier the replicator does not handle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self(n.to_string())),
            Value::Object(map) if map.len() == 1 => match map.get("$oid") {
                Some(Value::String(hex))
                    if hex.len() == 24 && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
                {
                    Some(Self(hex.to_ascii_lowercase()))
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Reads `_id` from a document.
    pub fn of(document: &Document) -> Option<Self> {
        document.get("_id").and_then(Self::from_value)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The representation written to the target store: the source fields plus
/// `_ts` (the integer timestamp of the entry that produced this version) and
/// `ns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedDocument {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    pub ns: Namespace,
    #[serde(rename = "_ts")]
    pub ts: u64,
    #[serde(flatten)]
    pub fields: Document,
}

impl ReplicatedDocument {
    /// Builds the target representation. Source fields named `_id`, `_ts`
    /// or `ns` are replaced by the replicator's own values.
    pub fn new(id: DocumentId, ns: Namespace, ts: Timestamp, mut fields: Document) -> Self {
        fields.remove("_id");
        fields.remove("_ts");
        fields.remove("ns");
        Self {
            id,
            ns,
            ts: ts.as_u64(),
            fields,
        }
    }

    /// Builds the target representation of a source document, `None` if the
    /// document has no usable `_id`.
    pub fn from_source(ns: Namespace, ts: Timestamp, document: Document) -> Option<Self> {
        let id = DocumentId::of(&document)?;
        Some(Self::new(id, ns, ts, document))
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_u64(self.ts)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_id_shapes() {
        assert_eq!(DocumentId::from_value(&json!("abc")), Some(DocumentId::new("abc")));
        assert_eq!(DocumentId::from_value(&json!(42)), Some(DocumentId::new("42")));
        assert_eq!(
            DocumentId::from_value(&json!({"$oid": "4FF74DB3F646462B38000001"})),
            Some(DocumentId::new("4ff74db3f646462b38000001"))
        );

        assert_eq!(DocumentId::from_value(&json!("")), None);
        assert_eq!(DocumentId::from_value(&json!(1.5)), None);
        assert_eq!(DocumentId::from_value(&json!({"$oid": "short"})), None);
        assert_eq!(DocumentId::from_value(&json!({"a": 1, "b": 2})), None);
        assert_eq!(DocumentId::from_value(&json!([1])), None);
        assert_eq!(DocumentId::from_value(&Value::Null), None);
    }

    #[test]
    fn test_replicated_document_shape() {
        let source = doc(json!({"_id": "a1", "name": "paulie", "ns": "shadowed"}));
        let ts = Timestamp::new(1_700_000_000, 1);
        let replicated =
            ReplicatedDocument::from_source(Namespace::new("alpha", "foo"), ts, source).unwrap();

        let value = serde_json::to_value(&replicated).unwrap();
        assert_eq!(value["_id"], "a1");
        assert_eq!(value["ns"], "alpha.foo");
        assert_eq!(value["_ts"], ts.as_u64());
        assert_eq!(value["name"], "paulie");

        let back: ReplicatedDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back, replicated);
        assert_eq!(back.timestamp(), ts);
    }

    #[test]
    fn test_from_source_requires_id() {
        let source = doc(json!({"name": "no id"}));
        assert!(ReplicatedDocument::from_source(
            Namespace::new("alpha", "foo"),
            Timestamp::default(),
            source
        )
        .is_none());
    }
}
