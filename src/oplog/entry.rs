//! Raw oplog records.
//!
//! Field names follow the replica set's own oplog layout:
//! - `ts`: position of the entry in the stream
//! - `op`: operation code (`i`, `u`, `d`, `n`, `c`)
//! - `ns`: affected namespace (`db.$cmd` for commands, empty for no-ops)
//! - `o`: the operation document
//! - `o2`: the update selector

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::document::{Document, DocumentId};
use super::namespace::Namespace;
use crate::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    #[serde(rename = "n")]
    Noop,
    #[serde(rename = "c")]
    Command,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: Timestamp,
    pub op: OpCode,
    #[serde(default)]
    pub ns: String,
    #[serde(default)]
    pub o: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o2: Option<Document>,
}

impl OplogEntry {
    pub fn insert(ts: Timestamp, ns: &Namespace, document: Document) -> Self {
        Self {
            ts,
            op: OpCode::Insert,
            ns: ns.to_string(),
            o: document,
            o2: None,
        }
    }

    /// A replacement-style update: `o` holds the new document, `o2` selects
    /// it by `_id`.
    pub fn update(ts: Timestamp, ns: &Namespace, id: &DocumentId, document: Document) -> Self {
        Self {
            ts,
            op: OpCode::Update,
            ns: ns.to_string(),
            o: document,
            o2: Some(id_selector(id)),
        }
    }

    pub fn delete(ts: Timestamp, ns: &Namespace, id: &DocumentId) -> Self {
        Self {
            ts,
            op: OpCode::Delete,
            ns: ns.to_string(),
            o: id_selector(id),
            o2: None,
        }
    }

    pub fn noop(ts: Timestamp, message: &str) -> Self {
        let mut o = Document::new();
        o.insert("msg".to_string(), Value::String(message.to_string()));
        Self {
            ts,
            op: OpCode::Noop,
            ns: String::new(),
            o,
            o2: None,
        }
    }

    pub fn command(ts: Timestamp, database: &str, command: Document) -> Self {
        Self {
            ts,
            op: OpCode::Command,
            ns: format!("{}.$cmd", database),
            o: command,
            o2: None,
        }
    }

    pub fn namespace(&self) -> Option<Namespace> {
        Namespace::parse(&self.ns).ok()
    }
}

fn id_selector(id: &DocumentId) -> Document {
    match json!({ "_id": id.as_str() }) {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
