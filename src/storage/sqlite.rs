//! Relational store: one row per node in a SQLite database.
//!
//! Rows keep the identity columns next to the serialised record so they
//! can be indexed; the record itself uses the same XML format as the
//! embedded store. Staged rows are applied inside one SQL transaction, so
//! a commit is atomic across all its records.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info, warn};

use super::idgen::{IdGenerator, COUNTER_SLOT};
use super::transaction::{StagedRow, StagedWrite, Transaction};
use super::{create_reserved_roots, BackendKind, Database};
use crate::app::AppContext;
use crate::codec::{write_to_string, RecordReader, WriterOptions};
use crate::error::{Error, Result};
use crate::model::NodeRef;

/// File name of the database below the configured home.
pub const DB_FILE: &str = "hopdb.sqlite";

const COUNTER_KEY: &str = "idgen";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hop_nodes (
    id TEXT PRIMARY KEY,
    prototype TEXT,
    name TEXT NOT NULL,
    parent_id TEXT,
    created INTEGER NOT NULL,
    last_modified INTEGER NOT NULL,
    record TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hop_nodes_parent ON hop_nodes (parent_id);
CREATE INDEX IF NOT EXISTS idx_hop_nodes_prototype ON hop_nodes (prototype);
CREATE TABLE IF NOT EXISTS hop_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// SQLite backend.
pub struct SqliteDatabase {
    path: PathBuf,
    conn: Option<Mutex<Connection>>,
    idgen: IdGenerator,
    sync_on_commit: bool,
}

impl SqliteDatabase {
    pub fn new(sync_on_commit: bool) -> Self {
        Self {
            path: PathBuf::new(),
            conn: None,
            idgen: IdGenerator::new(1),
            sync_on_commit,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<&Mutex<Connection>> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Database("sqlite database is not initialised".into()))
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        let synchronous = if self.sync_on_commit { "FULL" } else { "NORMAL" };
        conn.pragma_update(None, "synchronous", synchronous)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    fn exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?.lock();
        let found = conn
            .query_row("SELECT 1 FROM hop_nodes WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn stored_counter(conn: &Connection) -> Result<Option<u64>> {
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM hop_meta WHERE key = ?1",
                params![COUNTER_KEY],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map_err(|e| Error::Database(format!("bad id counter {v:?}: {e}")))
            })
            .transpose()
    }

    /// Ids of the rows whose parent column is `parent_id`, in id order.
    pub fn child_ids(&self, parent_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?.lock();
        let mut stmt = conn.prepare("SELECT id FROM hop_nodes WHERE parent_id = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![parent_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn()?.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM hop_nodes", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn source(&self, id: &str) -> PathBuf {
        PathBuf::from(format!("{}#{id}", self.path.display()))
    }
}

impl Database for SqliteDatabase {
    fn init(&mut self, home: &Path, app: &AppContext) -> Result<()> {
        fs::create_dir_all(home).map_err(|err| {
            Error::Database(format!("cannot create database directory {}: {err}", home.display()))
        })?;
        self.path = home.join(DB_FILE);
        let conn = self.open_connection().map_err(|err| {
            error!(path = %self.path.display(), error = %err, "cannot open sqlite database");
            Error::Database(format!("cannot open {}: {err}", self.path.display()))
        })?;

        let base = app.id_base_value();
        let idgen = IdGenerator::new(Self::stored_counter(&conn)?.unwrap_or(0));
        idgen.raise_to(base);
        self.idgen = idgen;
        self.conn = Some(Mutex::new(conn));

        let this: &Self = self;
        create_reserved_roots(this, app, &|id| this.exists(id)).map_err(|err| {
            error!(path = %this.path.display(), error = %err, "initialising sqlite database failed");
            Error::Database(format!("cannot initialise {}: {err}", this.path.display()))
        })?;
        info!(path = %self.path.display(), counter = self.idgen.value(), "sqlite database ready");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        if let Some(conn) = &self.conn {
            let conn = conn.lock();
            if let Err(err) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
                warn!(error = %err, "checkpoint on shutdown failed");
            }
        }
        debug!(path = %self.path.display(), "sqlite database shut down");
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn begin_transaction(&self, name: &str) -> Result<Transaction> {
        self.conn()?;
        Ok(Transaction::new(name))
    }

    fn commit_transaction(&self, txn: &mut Transaction) -> Result<()> {
        txn.ensure_open()?;
        let flushed = self.idgen.pending_flush();
        if let Some(value) = flushed {
            txn.add_write_first(COUNTER_SLOT, StagedWrite::Counter(value))?;
        }
        let name = txn.name().to_string();
        let (writes, deletes) = txn.take_for_commit()?;

        let mut conn = self.conn()?.lock();
        let sql = conn.transaction()?;
        for (id, write) in writes {
            match write {
                StagedWrite::Counter(value) => {
                    sql.execute(
                        "INSERT INTO hop_meta (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        params![COUNTER_KEY, value.to_string()],
                    )?;
                }
                StagedWrite::Row(row) => {
                    sql.execute(
                        "INSERT INTO hop_nodes (id, prototype, name, parent_id, created, last_modified, record)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT(id) DO UPDATE SET
                            prototype = excluded.prototype,
                            name = excluded.name,
                            parent_id = excluded.parent_id,
                            created = excluded.created,
                            last_modified = excluded.last_modified,
                            record = excluded.record",
                        params![
                            row.id,
                            row.prototype,
                            row.name,
                            row.parent_id,
                            row.created,
                            row.last_modified,
                            row.record
                        ],
                    )?;
                }
                StagedWrite::File { target, .. } => {
                    warn!(id = %id, target = %target.display(), "ignoring file write")
                }
            }
        }
        for id in &deletes {
            sql.execute("DELETE FROM hop_nodes WHERE id = ?1", params![id])?;
        }
        sql.commit().inspect_err(|err| {
            error!(txn = %name, error = %err, "sqlite commit failed");
        })?;

        if let Some(value) = flushed {
            self.idgen.mark_flushed(value);
        }
        debug!(txn = %name, deletes = deletes.len(), "sqlite transaction committed");
        Ok(())
    }

    fn abort_transaction(&self, txn: &mut Transaction) -> Result<()> {
        let discarded = txn.discard()?;
        debug!(txn = %txn.name(), discarded, "sqlite transaction aborted");
        Ok(())
    }

    fn get_node(&self, id: &str, reader: &RecordReader<'_>) -> Result<NodeRef> {
        let record: Option<String> = {
            let conn = self.conn()?.lock();
            conn.query_row(
                "SELECT record FROM hop_nodes WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
        };
        let record = record.ok_or_else(|| Error::not_found(id))?;
        let source = self.source(id);
        reader.read_str(&record, &source).inspect_err(|err| {
            error!(record = %source.display(), error = %err, "error reading node row");
        })
    }

    fn insert_node(&self, txn: &mut Transaction, id: &str, node: &NodeRef) -> Result<()> {
        if self.exists(id)? {
            return Err(Error::DuplicateKey(id.to_string()));
        }
        self.update_node(txn, id, node)
    }

    fn update_node(&self, txn: &mut Transaction, id: &str, node: &NodeRef) -> Result<()> {
        txn.ensure_open()?;
        let record = write_to_string(node, WriterOptions::database(None))?;
        let row = StagedRow {
            id: id.to_string(),
            prototype: node.declared_prototype(),
            name: node.name(),
            parent_id: node.parent_ref().map(|(parent, _)| parent),
            created: node.created(),
            last_modified: node.last_modified(),
            record,
        };
        txn.add_write(id, StagedWrite::Row(row))
    }

    fn delete_node(&self, txn: &mut Transaction, id: &str) -> Result<()> {
        txn.add_delete(id)
    }

    fn next_id(&self) -> Result<String> {
        self.conn()?;
        Ok(self.idgen.next_id())
    }
}
