//! Error handling for hopdb operations.
//!
//! The storage layer reports failures through [`Error`]; the node layer
//! returns `Result` from mutations and falls back to defaults on reads.
//!
//! # Error Types
//!
//! - [`Error`] - Main error enum with variants for different failure modes
//! - [`Result`] - Result type alias for convenience
//!
//! # Error Handling Pattern
//!
//! ```rust,ignore
//! use hopdb::{DbKey, Error};
//!
//! match manager.get_node(&DbKey::embedded("42")) {
//!     Ok(node) => println!("{}", node.name()),
//!     Err(err) if err.is_not_found() => println!("create it"),
//!     Err(err) => return Err(err),
//! }
//! ```

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for hopdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the persistence layer.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No record is stored under the requested key.
    ///
    /// This is an expected condition: callers routinely use it to decide
    /// between creating a node and propagating the failure.
    #[error("object not found: {key}")]
    NotFound {
        /// Key that was looked up.
        key: String,
    },

    /// The storage location is unusable (not creatable, not writable,
    /// failed initialisation).
    #[error("database error: {0}")]
    Database(String),

    /// A stored record could not be parsed.
    ///
    /// Fatal for the single record, not for the store.
    #[error("malformed record {}: {reason}", path.display())]
    Malformed {
        /// File (or logical location) of the offending record.
        path: PathBuf,
        /// Parser diagnostic.
        reason: String,
    },

    /// `insert_node` was called for a key that already has a record.
    #[error("cannot insert node with existing key {0}")]
    DuplicateKey(String),

    /// Invalid argument or structural misuse by calling code.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A node is write-locked by another transactor or was invalidated.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// The operation needs a transactor bound to the current thread.
    #[error("operation requires a transactor, but current thread does not have one")]
    NoTransactor,

    /// The current thread's transactor is not inside a transaction.
    #[error("transactor is not active")]
    TransactionInactive,

    /// A storage transaction was used after commit or abort.
    #[error("transaction {0} is already closed")]
    TransactionClosed(String),

    /// Error reported by the relational backend.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Error reported by the XML tokenizer.
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Configuration could not be read or parsed.
    #[error("config error in {}: {reason}", path.display())]
    Config {
        /// Configuration file.
        path: PathBuf,
        /// Underlying diagnostic.
        reason: String,
    },
}

impl Error {
    /// Builds a [`Error::NotFound`] for the given key.
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// Builds a [`Error::Malformed`] for the given location.
    pub fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Malformed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true for the recoverable "no such record" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Returns true for write-lock and invalid-node conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict(_))
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Error::Xml(err.into())
    }
}

impl From<time::error::Format> for Error {
    fn from(err: time::error::Format) -> Self {
        Error::InvalidArgument(format!("date format: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_recoverable() {
        let err = Error::not_found("42");
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        assert_eq!(err.to_string(), "object not found: 42");
    }

    #[test]
    fn malformed_reports_path() {
        let err = Error::malformed("/db/7.xml", "unexpected eof");
        assert_eq!(err.to_string(), "malformed record /db/7.xml: unexpected eof");
    }
}
