use std::fmt;
use std::path::PathBuf;
use std::thread::{self, ThreadId};
use std::time::Instant;

use tempfile::TempPath;
use tracing::debug;

use crate::error::{Error, Result};

/// The state of a storage transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting writes and deletes.
    Open,
    /// Pending changes were applied.
    Committed,
    /// Pending changes were discarded.
    Aborted,
}

/// A row staged for the relational backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRow {
    pub id: String,
    pub prototype: Option<String>,
    pub name: String,
    pub parent_id: Option<String>,
    pub created: i64,
    pub last_modified: i64,
    pub record: String,
}

/// A write waiting for commit.
pub enum StagedWrite {
    /// Fully written and synced temp file, renamed over `target` at commit.
    /// Dropping it removes the temp file.
    File { target: PathBuf, temp: TempPath },
    /// Buffered row, applied inside one SQL transaction.
    Row(StagedRow),
    /// New value of the id counter.
    Counter(u64),
}

impl StagedWrite {
    fn describe(&self) -> String {
        match self {
            StagedWrite::File { target, .. } => target.display().to_string(),
            StagedWrite::Row(row) => format!("row {}", row.id),
            StagedWrite::Counter(value) => format!("counter {value}"),
        }
    }
}

impl fmt::Debug for StagedWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Unit of work collecting pending writes and deletes.
///
/// Created by [`super::Database::begin_transaction`] and bound to the
/// creating thread. Once committed or aborted every further use fails with
/// [`Error::TransactionClosed`].
#[derive(Debug)]
pub struct Transaction {
    name: String,
    state: TxState,
    thread: ThreadId,
    started: Instant,
    writes: Vec<(String, StagedWrite)>,
    deletes: Vec<String>,
}

impl Transaction {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug!(txn = %name, "storage transaction started");
        Self {
            name,
            state: TxState::Open,
            thread: thread::current().id(),
            started: Instant::now(),
            writes: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TxState::Open
    }

    pub fn elapsed_millis(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Fails unless the transaction is open and used from its own thread.
    pub fn ensure_open(&self) -> Result<()> {
        if self.state != TxState::Open {
            return Err(Error::TransactionClosed(self.name.clone()));
        }
        if thread::current().id() != self.thread {
            return Err(Error::InvalidArgument(format!(
                "transaction {} used outside its thread",
                self.name
            )));
        }
        Ok(())
    }

    /// Registers a write for `id`. A later write for the same id replaces
    /// the earlier one in place, and cancels a pending delete.
    pub fn add_write(&mut self, id: &str, write: StagedWrite) -> Result<()> {
        self.ensure_open()?;
        self.deletes.retain(|d| d != id);
        match self.writes.iter_mut().find(|(staged, _)| staged == id) {
            Some(slot) => slot.1 = write,
            None => self.writes.push((id.to_string(), write)),
        }
        Ok(())
    }

    /// Registers a write ahead of all others.
    pub fn add_write_first(&mut self, id: &str, write: StagedWrite) -> Result<()> {
        self.ensure_open()?;
        self.writes.retain(|(staged, _)| staged != id);
        self.writes.insert(0, (id.to_string(), write));
        Ok(())
    }

    /// Registers a delete for `id`, dropping any pending write for it.
    pub fn add_delete(&mut self, id: &str) -> Result<()> {
        self.ensure_open()?;
        self.writes.retain(|(staged, _)| staged != id);
        if !self.deletes.iter().any(|d| d == id) {
            self.deletes.push(id.to_string());
        }
        Ok(())
    }

    pub fn has_write(&self, id: &str) -> bool {
        self.writes.iter().any(|(staged, _)| staged == id)
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn pending_deletes(&self) -> usize {
        self.deletes.len()
    }

    /// Hands the pending changes to the backend and closes the transaction.
    pub(crate) fn take_for_commit(&mut self) -> Result<(Vec<(String, StagedWrite)>, Vec<String>)> {
        self.ensure_open()?;
        self.state = TxState::Committed;
        Ok((
            std::mem::take(&mut self.writes),
            std::mem::take(&mut self.deletes),
        ))
    }

    /// Drops the pending changes (removing staged temp files) and closes
    /// the transaction.
    pub(crate) fn discard(&mut self) -> Result<usize> {
        self.ensure_open()?;
        self.state = TxState::Aborted;
        let discarded = self.writes.len() + self.deletes.len();
        self.writes.clear();
        self.deletes.clear();
        Ok(discarded)
    }
}
