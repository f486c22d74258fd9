pub mod decoder;
pub mod document;
pub mod entry;
pub mod namespace;

pub use decoder::{Command, Operation};
pub use document::{Document, DocumentId, ReplicatedDocument};
pub use entry::{OpCode, OplogEntry};
pub use namespace::{Namespace, NamespaceSet};
