//! Embedded store: one XML file per node in a directory.
//!
//! ```text
//! <home>/
//!   helma.xsl             stylesheet for browsing records
//!   idgen.xml             id counter
//!   0.xml, 1.xml          reserved roots
//!   <id>.xml              one record per node
//!   <id>.xml.<rand>.tmp   staged writes, renamed at commit
//! ```
//!
//! Each record is replaced atomically: its new content is written and
//! synced to a temp file in the same directory, then renamed over the old
//! file. A commit touching several records is atomic per record only.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::TempPath;
use tracing::{debug, error, info, warn};

use super::idgen::{IdGenerator, COUNTER_SLOT, IDGEN_FILE};
use super::transaction::{StagedWrite, Transaction};
use super::{create_reserved_roots, BackendKind, Database};
use crate::app::AppContext;
use crate::codec::{write_to_string, RecordReader, WriterOptions, STYLESHEET};
use crate::error::{Error, Result};
use crate::model::NodeRef;

const STYLESHEET_SOURCE: &str = include_str!("../../assets/helma.xsl");

/// Directory-of-files backend.
#[derive(Debug)]
pub struct XmlDatabase {
    home: PathBuf,
    encoding: Option<String>,
    idgen: IdGenerator,
    sync_on_commit: bool,
    ready: bool,
    /// Serialises commits so counter files land in issue order.
    commit_lock: Mutex<()>,
}

impl XmlDatabase {
    pub fn new(sync_on_commit: bool) -> Self {
        Self {
            home: PathBuf::new(),
            encoding: None,
            idgen: IdGenerator::new(1),
            sync_on_commit,
            ready: false,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    pub fn set_encoding(&mut self, encoding: Option<String>) {
        self.encoding = encoding;
    }

    /// File holding the record for `id`.
    pub fn record_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(Error::InvalidArgument(format!(
                "{id:?} is not usable as a record id"
            )));
        }
        Ok(self.home.join(format!("{id}.xml")))
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready {
            Ok(())
        } else {
            Err(Error::Database("xml database is not initialised".into()))
        }
    }

    /// Writes `content` to a fresh temp file next to `file_name`.
    fn stage(&self, file_name: &str, content: &[u8]) -> Result<TempPath> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{file_name}."))
            .suffix(".tmp")
            .tempfile_in(&self.home)?;
        file.write_all(content)?;
        file.flush()?;
        if self.sync_on_commit {
            file.as_file().sync_all()?;
        }
        Ok(file.into_temp_path())
    }

    fn check_writable(target: &Path) -> Result<()> {
        match fs::metadata(target) {
            Ok(meta) if meta.permissions().readonly() => Err(Error::Database(format!(
                "no write permission for {}",
                target.display()
            ))),
            _ => Ok(()),
        }
    }

    fn copy_stylesheet(&self) {
        let target = self.home.join(STYLESHEET);
        if target.exists() {
            return;
        }
        if let Err(err) = fs::write(&target, STYLESHEET_SOURCE) {
            warn!(path = %target.display(), error = %err, "could not copy stylesheet");
        }
    }

    /// Removes temp files left behind by an interrupted commit.
    fn sweep_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.home)? {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(".tmp") {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "could not remove stale temp file")
                }
            }
        }
        if removed > 0 {
            info!(home = %self.home.display(), removed, "swept stale temp files");
        }
        Ok(removed)
    }

    fn sync_home(&self) {
        if !self.sync_on_commit {
            return;
        }
        if let Err(err) = File::open(&self.home).and_then(|dir| dir.sync_all()) {
            debug!(home = %self.home.display(), error = %err, "directory sync not available");
        }
    }
}

impl Database for XmlDatabase {
    fn init(&mut self, home: &Path, app: &AppContext) -> Result<()> {
        fs::create_dir_all(home).map_err(|err| {
            Error::Database(format!("cannot create database directory {}: {err}", home.display()))
        })?;
        let meta = fs::metadata(home)?;
        if !meta.is_dir() || meta.permissions().readonly() {
            return Err(Error::Database(format!(
                "database directory {} is not writable",
                home.display()
            )));
        }
        self.home = home.to_path_buf();
        self.copy_stylesheet();
        self.sweep_temp_files()?;
        self.encoding = app.charset().map(str::to_string);

        let base = app.id_base_value();
        self.idgen = match IdGenerator::load(&self.home.join(IDGEN_FILE)) {
            Ok(idgen) => {
                idgen.raise_to(base);
                idgen
            }
            Err(err) if err.is_not_found() => {
                let idgen = IdGenerator::new(0);
                idgen.raise_to(base);
                idgen
            }
            Err(err) => return Err(err),
        };
        self.ready = true;

        let this: &Self = self;
        create_reserved_roots(this, app, &|id| Ok(this.record_path(id)?.exists())).map_err(
            |err| {
                error!(home = %this.home.display(), error = %err, "initialising xml database failed");
                Error::Database(format!("cannot initialise {}: {err}", this.home.display()))
            },
        )?;
        info!(home = %self.home.display(), counter = self.idgen.value(), "xml database ready");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        debug!(home = %self.home.display(), "xml database shut down");
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Xml
    }

    fn begin_transaction(&self, name: &str) -> Result<Transaction> {
        self.ensure_ready()?;
        Ok(Transaction::new(name))
    }

    fn commit_transaction(&self, txn: &mut Transaction) -> Result<()> {
        txn.ensure_open()?;
        let _serial = self.commit_lock.lock();
        let flushed = self.idgen.pending_flush();
        if let Some(value) = flushed {
            let target = self.home.join(IDGEN_FILE);
            Self::check_writable(&target)?;
            let temp = self.stage(IDGEN_FILE, IdGenerator::to_xml(value).as_bytes())?;
            txn.add_write_first(COUNTER_SLOT, StagedWrite::File { target, temp })?;
        }

        let (writes, deletes) = txn.take_for_commit()?;
        let mut pending = writes.into_iter();
        while let Some((id, write)) = pending.next() {
            let (target, temp) = match write {
                StagedWrite::File { target, temp } => (target, temp),
                other => {
                    warn!(id = %id, write = ?other, "ignoring non-file write");
                    continue;
                }
            };
            if let Err(err) = temp.persist(&target) {
                // Dropping the staged writes removes their temp files.
                let abandoned = pending.len() + 1;
                drop(pending);
                error!(
                    target = %target.display(),
                    error = %err.error,
                    abandoned,
                    "could not move temp file into place, abandoning commit"
                );
                self.sync_home();
                return Err(Error::Io(err.error));
            }
        }
        let mut failure: Option<Error> = None;
        for id in deletes {
            let path = self.record_path(&id)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "deleted record was never stored")
                }
                Err(err) => {
                    error!(path = %path.display(), error = %err, "could not delete record");
                    failure.get_or_insert(Error::Io(err));
                }
            }
        }
        self.sync_home();

        match failure {
            Some(err) => Err(err),
            None => {
                if let Some(value) = flushed {
                    self.idgen.mark_flushed(value);
                }
                debug!(txn = %txn.name(), millis = txn.elapsed_millis(), "xml transaction committed");
                Ok(())
            }
        }
    }

    fn abort_transaction(&self, txn: &mut Transaction) -> Result<()> {
        let discarded = txn.discard()?;
        debug!(txn = %txn.name(), discarded, "xml transaction aborted");
        Ok(())
    }

    fn get_node(&self, id: &str, reader: &RecordReader<'_>) -> Result<NodeRef> {
        let path = self.record_path(id)?;
        if !path.exists() {
            return Err(Error::not_found(id));
        }
        reader.read_file(&path)
    }

    fn insert_node(&self, txn: &mut Transaction, id: &str, node: &NodeRef) -> Result<()> {
        if self.record_path(id)?.exists() {
            return Err(Error::DuplicateKey(id.to_string()));
        }
        self.update_node(txn, id, node)
    }

    fn update_node(&self, txn: &mut Transaction, id: &str, node: &NodeRef) -> Result<()> {
        txn.ensure_open()?;
        let target = self.record_path(id)?;
        Self::check_writable(&target)?;
        let xml = write_to_string(node, WriterOptions::database(self.encoding.clone()))?;
        let temp = self.stage(&format!("{id}.xml"), xml.as_bytes())?;
        txn.add_write(id, StagedWrite::File { target, temp })
    }

    fn delete_node(&self, txn: &mut Transaction, id: &str) -> Result<()> {
        self.record_path(id)?;
        txn.add_delete(id)
    }

    fn next_id(&self) -> Result<String> {
        self.ensure_ready()?;
        Ok(self.idgen.next_id())
    }
}
