//! Error types and result handling for oplog-replicator.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use oplog_replicator::{Error, Result};
//!
//! fn reach_primary() -> Result<()> {
//!     // Simulating an unreachable replica set member
//!     Err(Error::Connection("no primary available".to_string()))
//! }
//!
//! match reach_primary() {
//!     Ok(()) => println!("Connected"),
//!     Err(e) if e.is_transient() => eprintln!("Will retry: {}", e),
//!     Err(e) => eprintln!("Fatal: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for oplog-replicator operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration was loaded but holds invalid values.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization error, typically from ledger files.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from ledger file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The source replica set could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The document manager (target store) could not be reached.
    #[error("Target store error: {0}")]
    Target(String),

    /// The oplog rotated past the position a cursor was reading from.
    #[error("Cursor invalidated: {message}")]
    CursorInvalidated {
        /// Description of the invalidated position
        message: String,
    },

    /// An oplog entry did not have the expected shape.
    #[error("Invalid oplog entry: {message}")]
    InvalidEntry {
        /// Description of what was invalid
        message: String,
    },

    /// The progress ledger rejected an operation.
    #[error("Ledger error: {message}")]
    Ledger {
        /// Description of the ledger error
        message: String,
    },

    /// A spawned worker task panicked or was cancelled.
    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Graceful shutdown was requested while work was in progress.
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly unwind out of a dump or a retry loop.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Returns `true` for failures that are expected to clear up on their own
    /// (an unreachable source or target) and should be retried
    /// with backoff instead of stopping the worker.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Target(_))
    }

    pub(crate) fn invalid_entry(message: impl Into<String>) -> Self {
        Error::InvalidEntry {
            message: message.into(),
        }
    }
}

/// A convenient Result type alias for oplog-replicator operations.
///
/// This is equivalent to `std::result::Result<T, oplog_replicator::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
