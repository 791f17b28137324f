//! Storage backends for persistent nodes.
//!
//! A [`Database`] stores one record per node, keyed by the node id. Writes
//! and deletes are staged in a [`Transaction`] and applied at commit. Two
//! backends exist: [`XmlDatabase`] keeps one XML file per node in a
//! directory, [`SqliteDatabase`] keeps one row per node in a SQLite file.

pub mod idgen;
pub mod sqlite;
pub mod transaction;
pub mod xml;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::app::AppContext;
use crate::codec::RecordReader;
use crate::error::Result;
use crate::model::{Node, NodeParts, NodeRef, NodeState};

pub use idgen::IdGenerator;
pub use sqlite::SqliteDatabase;
pub use transaction::{StagedRow, StagedWrite, Transaction, TxState};
pub use xml::XmlDatabase;

/// Id of the application root record.
pub const ROOT_ID: &str = "0";
/// Id of the user root record.
pub const USER_ROOT_ID: &str = "1";
/// Prototype of the user root record.
pub const USER_ROOT_PROTOTYPE: &str = "__userroot__";

/// Which backend stores the records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One XML file per node.
    #[default]
    Xml,
    /// One row per node in a SQLite database.
    Sqlite,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Xml => f.write_str("xml"),
            BackendKind::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Record store used by the node manager.
///
/// Implementations are shared between threads; each thread works in its
/// own [`Transaction`].
pub trait Database: Send + Sync {
    /// Prepares the store below `home`. Idempotent.
    ///
    /// Creates the location, loads the id counter (raising it to the
    /// configured base value) and creates the reserved root records.
    fn init(&mut self, home: &Path, app: &AppContext) -> Result<()>;

    fn shutdown(&self) -> Result<()>;

    fn kind(&self) -> BackendKind;

    fn begin_transaction(&self, name: &str) -> Result<Transaction>;

    /// Flushes the id counter if needed, then applies the staged writes in
    /// registration order followed by the deletes.
    fn commit_transaction(&self, txn: &mut Transaction) -> Result<()>;

    /// Discards everything staged in `txn`.
    fn abort_transaction(&self, txn: &mut Transaction) -> Result<()>;

    /// Reads the record stored under `id`.
    ///
    /// `NotFound` if there is none, `Malformed` if it cannot be parsed.
    fn get_node(&self, id: &str, reader: &RecordReader<'_>) -> Result<NodeRef>;

    /// Like [`Database::update_node`], but fails with `DuplicateKey` if a
    /// record for `id` already exists.
    fn insert_node(&self, txn: &mut Transaction, id: &str, node: &NodeRef) -> Result<()>;

    /// Serialises `node` and stages it as the new record for `id`.
    fn update_node(&self, txn: &mut Transaction, id: &str, node: &NodeRef) -> Result<()>;

    fn delete_node(&self, txn: &mut Transaction, id: &str) -> Result<()>;

    fn next_id(&self) -> Result<String>;
}

/// Creates an uninitialised backend of the given kind.
pub fn open_backend(kind: BackendKind, sync_on_commit: bool) -> Box<dyn Database> {
    match kind {
        BackendKind::Xml => Box::new(XmlDatabase::new(sync_on_commit)),
        BackendKind::Sqlite => Box::new(SqliteDatabase::new(sync_on_commit)),
    }
}

/// The records every store starts with: the root and the user root.
pub(crate) fn reserved_roots(app: &AppContext) -> [NodeRef; 2] {
    let mut root = NodeParts::new(ROOT_ID, NodeState::Clean);
    root.name = Some("root".into());
    root.prototype = Some("Root".into());
    root.mapping = app.registry().get("root");

    let mut users = NodeParts::new(USER_ROOT_ID, NodeState::Clean);
    users.name = Some("users".into());
    users.prototype = Some(USER_ROOT_PROTOTYPE.into());
    users.mapping = app.registry().get(USER_ROOT_PROTOTYPE);

    [Node::from_parts(root), Node::from_parts(users)]
}

/// Creates the reserved roots that are missing, in one transaction.
pub(crate) fn create_reserved_roots(
    db: &dyn Database,
    app: &AppContext,
    exists: &dyn Fn(&str) -> Result<bool>,
) -> Result<()> {
    let mut txn = db.begin_transaction("init")?;
    let outcome = (|| {
        for root in reserved_roots(app) {
            let id = root.id();
            if !exists(&id)? {
                db.insert_node(&mut txn, &id, &root)?;
                tracing::info!(id = %id, name = %root.name(), "created root record");
            }
        }
        Ok(())
    })();
    match outcome {
        Ok(()) => db.commit_transaction(&mut txn),
        Err(err) => {
            if let Err(abort_err) = db.abort_transaction(&mut txn) {
                tracing::warn!(error = %abort_err, "aborting init transaction failed");
            }
            Err(err)
        }
    }
}
