use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::entry::OplogEntry;
use crate::{Error, Result};

const SYSTEM_DATABASES: [&str; 3] = ["admin", "local", "config"];

/// A `{database}.{collection}` pair identifying a source collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Splits on the first `.`; collection names may contain further dots.
    pub fn parse(name: &str) -> Result<Self> {
        match name.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::InvalidConfig(format!(
                "namespace '{}' is not of the form database.collection",
                name
            ))),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Internal namespaces that are never replicated unless listed explicitly.
    pub fn is_system(&self) -> bool {
        SYSTEM_DATABASES.contains(&self.database.as_str()) || self.collection.starts_with("system.")
    }

    pub fn is_command(&self) -> bool {
        self.collection == "$cmd"
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Namespace::parse(s)
    }
}

impl TryFrom<String> for Namespace {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Namespace::parse(&value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

/// The set of namespaces a worker replicates.
///
/// An empty set is unrestricted: every namespace outside the system
/// databases is in scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceSet {
    namespaces: BTreeSet<Namespace>,
}

impl NamespaceSet {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let namespaces = names
            .into_iter()
            .map(|name| Namespace::parse(name.as_ref()))
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Self { namespaces })
    }

    pub fn is_unrestricted(&self) -> bool {
        self.namespaces.is_empty()
    }

    pub fn contains(&self, ns: &Namespace) -> bool {
        if self.namespaces.is_empty() {
            !ns.is_system() && !ns.is_command()
        } else {
            self.namespaces.contains(ns)
        }
    }

    /// Whether a tailing cursor should deliver this entry: at least one
    /// namespace it affects must be in scope. Entries that affect no
    /// namespace (no-ops, unrecognised commands) are never delivered.
    pub fn admits(&self, entry: &OplogEntry) -> bool {
        if let Some(database) = entry.dropped_database() {
            return self.covers_database(&database);
        }
        entry
            .affected_namespaces()
            .iter()
            .any(|ns| self.contains(ns))
    }

    /// Whether any in-scope namespace can live in `database`.
    pub fn covers_database(&self, database: &str) -> bool {
        if self.namespaces.is_empty() {
            !SYSTEM_DATABASES.contains(&database)
        } else {
            self.in_database(database).next().is_some()
        }
    }

    /// Explicitly configured namespaces; empty when unrestricted.
    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.iter()
    }

    /// In-scope namespaces of one database.
    pub fn in_database<'a>(
        &'a self,
        database: &'a str,
    ) -> impl Iterator<Item = &'a Namespace> + 'a {
        self.namespaces
            .iter()
            .filter(move |ns| ns.database() == database)
    }
}

impl FromIterator<Namespace> for NamespaceSet {
    fn from_iter<T: IntoIterator<Item = Namespace>>(iter: T) -> Self {
        Self {
            namespaces: iter.into_iter().collect(),
        }
    }
}
