//! Per-thread coordinator of one transaction at a time.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::events::NodeChangeSet;
use super::NodeManager;
use crate::error::{Error, Result};
use crate::model::{DbKey, NodeRef, NodeState};
use crate::storage::Transaction;

/// Thread-local slot; dropping it at thread exit marks the transactor dead.
struct Slot(Option<Arc<Transactor>>);

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            tx.alive.store(false, Ordering::Release);
            if tx.is_active() {
                warn!(transactor = %tx.name(), "thread exited inside a transaction");
                if let Err(err) = tx.abort() {
                    error!(error = %err, "abort at thread exit failed");
                }
            }
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Slot> = const { RefCell::new(Slot(None)) };
}

struct TxCore {
    name: Option<String>,
    started: Instant,
    txn: Option<Transaction>,
    dirty: IndexMap<DbKey, NodeRef>,
    clean: HashMap<DbKey, NodeRef>,
    parents: Vec<NodeRef>,
}

impl TxCore {
    fn reset(&mut self) {
        self.dirty.clear();
        self.clean.clear();
        self.parents.clear();
        self.txn = None;
        self.name = None;
    }
}

/// Work that a finished or abandoned transaction left behind.
struct Taken {
    name: String,
    started: Instant,
    txn: Option<Transaction>,
    dirty: Vec<NodeRef>,
    parents: Vec<NodeRef>,
}

/// Tracks the nodes one thread touches inside a transaction and writes them
/// back at commit.
///
/// There is at most one transactor per thread, created by
/// [`NodeManager::begin`] and found again through [`Transactor::current`].
/// Other threads only ever ask a transactor whether it is alive and active,
/// when they find it holding a node's write lock.
pub struct Transactor {
    manager: Arc<NodeManager>,
    thread: ThreadId,
    alive: AtomicBool,
    killed: AtomicBool,
    active: AtomicBool,
    core: Mutex<TxCore>,
}

impl Transactor {
    fn new(manager: Arc<NodeManager>) -> Self {
        Self {
            manager,
            thread: thread::current().id(),
            alive: AtomicBool::new(true),
            killed: AtomicBool::new(false),
            active: AtomicBool::new(false),
            core: Mutex::new(TxCore {
                name: None,
                started: Instant::now(),
                txn: None,
                dirty: IndexMap::new(),
                clean: HashMap::new(),
                parents: Vec::new(),
            }),
        }
    }

    /// The transactor of the current thread, if any.
    pub fn current() -> Option<Arc<Transactor>> {
        CURRENT
            .try_with(|slot| slot.borrow().0.clone())
            .ok()
            .flatten()
    }

    /// Returns the current thread's transactor for `manager`, replacing one
    /// bound to another manager or killed.
    pub(crate) fn bind(manager: &Arc<NodeManager>) -> Arc<Transactor> {
        if let Some(tx) = Self::current() {
            if Arc::ptr_eq(&tx.manager, manager) && !tx.is_killed() {
                return tx;
            }
        }
        let tx = Arc::new(Transactor::new(Arc::clone(manager)));
        let previous = CURRENT.with(|slot| slot.borrow_mut().0.replace(Arc::clone(&tx)));
        if let Some(previous) = previous {
            if previous.is_active() {
                if let Err(err) = previous.abort() {
                    warn!(error = %err, "aborting replaced transactor failed");
                }
            }
        }
        tx
    }

    /// Unbinds the current thread's transactor, aborting an open transaction.
    pub fn release() -> Result<()> {
        let previous = CURRENT.with(|slot| slot.borrow_mut().0.take());
        match previous {
            Some(tx) if tx.is_active() => tx.abort(),
            _ => Ok(()),
        }
    }

    pub fn manager(&self) -> &Arc<NodeManager> {
        &self.manager
    }

    pub(crate) fn is_bound_to(&self, manager: &NodeManager) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.manager), manager)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// False once the owning thread exited or the transactor was killed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.is_killed()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Name of the running transaction, or the thread it belongs to.
    pub fn name(&self) -> String {
        match &self.core.lock().name {
            Some(name) => name.clone(),
            None => format!("{:?}", self.thread),
        }
    }

    /// Starts a transaction, aborting one that is still running.
    pub fn begin(&self, name: &str) -> Result<()> {
        if self.is_killed() {
            return Err(Error::Database(format!(
                "transaction {name} started on killed transactor"
            )));
        }
        if self.is_active() {
            warn!(transactor = %self.name(), next = name, "aborting unfinished transaction");
            self.abort()?;
        }
        let txn = self.manager.db().begin_transaction(name)?;
        let mut core = self.core.lock();
        core.reset();
        core.txn = Some(txn);
        core.name = Some(name.to_string());
        core.started = Instant::now();
        self.active.store(true, Ordering::Release);
        debug!(transactor = name, "transaction started");
        Ok(())
    }

    fn take(&self) -> Taken {
        let mut core = self.core.lock();
        let taken = Taken {
            name: core.name.clone().unwrap_or_default(),
            started: core.started,
            txn: core.txn.take(),
            dirty: std::mem::take(&mut core.dirty).into_values().collect(),
            parents: std::mem::take(&mut core.parents),
        };
        core.reset();
        taken
    }

    /// Writes every dirty node to storage, then marks them clean.
    ///
    /// New nodes are inserted, modified ones updated and deleted ones
    /// removed, in the order they were first touched; a node deleted after
    /// being touched is handled last. On success the changes are reported
    /// to the manager's listeners.
    pub fn commit(&self) -> Result<NodeChangeSet> {
        if self.is_killed() {
            return Err(Error::Database("commit called on killed transactor".into()));
        }
        if !self.is_active() {
            return Ok(NodeChangeSet::default());
        }
        let Taken {
            name,
            started,
            txn,
            dirty,
            parents,
        } = self.take();
        let Some(mut txn) = txn else {
            self.active.store(false, Ordering::Release);
            return Err(Error::TransactionInactive);
        };
        let db = self.manager.db();

        let staged = dirty.iter().try_for_each(|node| {
            let id = node.id();
            match node.state() {
                NodeState::New => db.insert_node(&mut txn, &id, node),
                NodeState::Modified => db.update_node(&mut txn, &id, node),
                NodeState::Deleted => db.delete_node(&mut txn, &id),
                _ => Ok(()),
            }
        });
        if let Err(err) = staged.and_then(|()| db.commit_transaction(&mut txn)) {
            error!(transactor = %name, error = %err, "commit failed, rolling back");
            let taken = Taken {
                name,
                started,
                txn: Some(txn),
                dirty,
                parents,
            };
            if let Err(abort_err) = self.roll_back(taken) {
                warn!(error = %abort_err, "discarding failed commit");
            }
            return Err(err);
        }

        let mut changes = NodeChangeSet::default();
        for node in dirty {
            match node.state() {
                NodeState::New => {
                    node.set_state(NodeState::Clean);
                    self.manager.register_node(&node);
                    changes.inserted.push(Arc::clone(&node));
                }
                NodeState::Modified => {
                    node.set_state(NodeState::Clean);
                    self.manager.register_node(&node);
                    changes.modified.push(Arc::clone(&node));
                }
                NodeState::Deleted => {
                    self.manager.evict_node(&node);
                    changes.deleted.push(Arc::clone(&node));
                }
                _ => {}
            }
            node.clear_write_lock();
        }
        changes.updated_parents = parents;
        self.active.store(false, Ordering::Release);

        let (inserted, modified, deleted) = changes.counts();
        let millis = started.elapsed().as_millis();
        if inserted + modified + deleted > 0 {
            info!("{name} done in {millis} millis [+{inserted}, ~{modified}, -{deleted}]");
        } else {
            info!("{name} done in {millis} millis");
        }
        for node in &changes.inserted {
            debug!(prototype = %node.prototype(), id = %node.id(), "inserted node");
        }
        for node in &changes.deleted {
            debug!(prototype = %node.prototype(), id = %node.id(), "removed node");
        }
        self.manager.fire_node_change(&changes);
        Ok(changes)
    }

    /// Discards the running transaction. Every dirty node is evicted so
    /// that the next access reloads the stored version.
    pub fn abort(&self) -> Result<()> {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        let taken = self.take();
        if was_active {
            self.roll_back(taken)
        } else {
            Ok(())
        }
    }

    fn roll_back(&self, taken: Taken) -> Result<()> {
        self.active.store(false, Ordering::Release);
        for node in &taken.dirty {
            self.manager.evict_node(node);
            node.clear_write_lock();
        }
        let result = match taken.txn {
            Some(mut txn) if txn.is_open() => self.manager.db().abort_transaction(&mut txn),
            _ => Ok(()),
        };
        info!(
            "{} aborted after {} millis",
            taken.name,
            taken.started.elapsed().as_millis()
        );
        result
    }

    /// Marks the transactor unusable. Locks it holds stop blocking other
    /// transactors, and its thread can no longer begin or commit.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        warn!(transactor = %self.name(), "transactor killed");
    }

    /// Registers `node` for writing at commit. A node re-registered as
    /// deleted moves to the end of the order.
    pub fn visit_dirty_node(&self, node: &NodeRef) {
        let Some(key) = node.key() else {
            return;
        };
        let deleted = node.state() == NodeState::Deleted;
        let mut core = self.core.lock();
        if deleted {
            core.dirty.shift_remove(&key);
        }
        core.dirty.insert(key, Arc::clone(node));
    }

    pub fn drop_dirty_node(&self, node: &NodeRef) {
        if let Some(key) = node.key() {
            self.core.lock().dirty.shift_remove(&key);
        }
    }

    pub fn get_dirty_node(&self, key: &DbKey) -> Option<NodeRef> {
        self.core.lock().dirty.get(key).cloned()
    }

    /// Keeps `node` as this transaction's instance for `key`. The first
    /// registration wins.
    pub fn visit_clean_node(&self, key: DbKey, node: &NodeRef) {
        self.core
            .lock()
            .clean
            .entry(key)
            .or_insert_with(|| Arc::clone(node));
    }

    pub fn drop_clean_node(&self, key: &DbKey) {
        self.core.lock().clean.remove(key);
    }

    pub fn get_clean_node(&self, key: &DbKey) -> Option<NodeRef> {
        self.core.lock().clean.get(key).cloned()
    }

    /// Records a node whose child list changed.
    pub fn visit_parent_node(&self, node: &NodeRef) {
        let mut core = self.core.lock();
        if !core.parents.iter().any(|p| Arc::ptr_eq(p, node)) {
            core.parents.push(Arc::clone(node));
        }
    }

    /// Dirty nodes in commit order.
    pub fn dirty_nodes(&self) -> Vec<NodeRef> {
        self.core.lock().dirty.values().cloned().collect()
    }
}

impl fmt::Debug for Transactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transactor")
            .field("thread", &self.thread)
            .field("active", &self.is_active())
            .field("alive", &self.is_alive())
            .finish()
    }
}
