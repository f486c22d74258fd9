use serde_json::Value;
use tracing::trace;

use super::document::{Document, DocumentId};
use super::entry::{OpCode, OplogEntry};
use super::namespace::Namespace;
use crate::{Error, Result};

/// A decoded oplog entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert {
        ns: Namespace,
        id: DocumentId,
        document: Document,
    },
    Update {
        ns: Namespace,
        id: DocumentId,
    },
    Delete {
        ns: Namespace,
        id: DocumentId,
    },
    Noop,
    Command(Command),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Drop(Namespace),
    DropDatabase(String),
    Rename { from: Namespace, to: Namespace },
    Create(Namespace),
    Other { database: String, name: String },
}

impl Command {
    /// Namespaces the command touches. `dropDatabase` touches a whole
    /// database and is reported through [`OplogEntry::dropped_database`].
    fn namespaces(&self) -> Vec<Namespace> {
        match self {
            Command::Drop(ns) | Command::Create(ns) => vec![ns.clone()],
            Command::Rename { from, to } => vec![from.clone(), to.clone()],
            Command::DropDatabase(_) | Command::Other { .. } => Vec::new(),
        }
    }
}

impl OplogEntry {
    /// Decodes the entry into an [`Operation`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEntry`] for an unknown op code, an unparsable
    /// namespace, or a CRUD entry without a usable `_id`.
    pub fn operation(&self) -> Result<Operation> {
        match self.op {
            OpCode::Noop => Ok(Operation::Noop),
            OpCode::Insert => {
                let ns = self.data_namespace()?;
                let id = require_id(&self.o, "insert")?;
                Ok(Operation::Insert {
                    ns,
                    id,
                    document: self.o.clone(),
                })
            }
            OpCode::Update => {
                let ns = self.data_namespace()?;
                let selector = self
                    .o2
                    .as_ref()
                    .ok_or_else(|| Error::invalid_entry(format!("update at {} has no selector", self.ts)))?;
                let id = require_id(selector, "update selector")?;
                Ok(Operation::Update { ns, id })
            }
            OpCode::Delete => {
                let ns = self.data_namespace()?;
                let id = require_id(&self.o, "delete")?;
                Ok(Operation::Delete { ns, id })
            }
            OpCode::Command => self.decode_command().map(Operation::Command),
            OpCode::Unknown => Err(Error::invalid_entry(format!(
                "unknown op code at {}",
                self.ts
            ))),
        }
    }

    /// Namespaces this entry affects, used for cursor-level filtering.
    ///
    /// Works on malformed entries too: a CRUD entry with a parsable `ns` is
    /// reported so the consumer can see and skip it.
    pub fn affected_namespaces(&self) -> Vec<Namespace> {
        match self.op {
            OpCode::Insert | OpCode::Update | OpCode::Delete => {
                self.namespace().into_iter().collect()
            }
            OpCode::Command => self
                .decode_command()
                .map(|command| command.namespaces())
                .unwrap_or_default(),
            OpCode::Noop | OpCode::Unknown => Vec::new(),
        }
    }

    pub fn dropped_database(&self) -> Option<String> {
        if self.op != OpCode::Command {
            return None;
        }
        match self.decode_command() {
            Ok(Command::DropDatabase(db)) => Some(db),
            _ => None,
        }
    }

    fn data_namespace(&self) -> Result<Namespace> {
        let ns = self
            .namespace()
            .ok_or_else(|| Error::invalid_entry(format!("bad namespace '{}' at {}", self.ns, self.ts)))?;
        if ns.is_command() {
            return Err(Error::invalid_entry(format!(
                "data operation on command namespace at {}",
                self.ts
            )));
        }
        Ok(ns)
    }

    fn decode_command(&self) -> Result<Command> {
        let ns = self
            .namespace()
            .ok_or_else(|| Error::invalid_entry(format!("bad command namespace '{}'", self.ns)))?;
        let database = ns.database().to_string();

        let command = if let Some(coll) = self.o.get("drop") {
            Command::Drop(Namespace::new(&database, string_field(coll, "drop")?))
        } else if self.o.contains_key("dropDatabase") {
            Command::DropDatabase(database)
        } else if let Some(from) = self.o.get("renameCollection") {
            let to = self
                .o
                .get("to")
                .ok_or_else(|| Error::invalid_entry("renameCollection without target"))?;
            Command::Rename {
                from: Namespace::parse(string_field(from, "renameCollection")?)?,
                to: Namespace::parse(string_field(to, "to")?)?,
            }
        } else if let Some(coll) = self.o.get("create") {
            Command::Create(Namespace::new(&database, string_field(coll, "create")?))
        } else {
            let name = self.o.keys().next().cloned().unwrap_or_default();
            trace!(command = %name, "unrecognised command entry");
            Command::Other { database, name }
        };
        Ok(command)
    }
}

fn require_id(document: &Document, what: &str) -> Result<DocumentId> {
    DocumentId::of(document)
        .ok_or_else(|| Error::invalid_entry(format!("{} without a usable _id", what)))
}

fn string_field<'a>(value: &'a Value, field: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| Error::invalid_entry(format!("command field '{}' is not a string", field)))
}
