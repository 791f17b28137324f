use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::cache::NodeCache;
use super::events::{ListenerRef, NodeChangeSet};
use super::transactor::Transactor;
use crate::codec::RecordReader;
use crate::error::Result;
use crate::model::{DbKey, DbMapping, MappingRegistry, Node, NodeRef, NodeState};
use crate::storage::{Database, ROOT_ID, USER_ROOT_ID};

/// Loads, caches and stores nodes for one database.
///
/// Lookups go through the current thread's transactor first, then the
/// shared cache and finally the database. Nodes keep a weak handle back to
/// their manager.
pub struct NodeManager {
    me: Weak<NodeManager>,
    db: Box<dyn Database>,
    cache: NodeCache,
    registry: Arc<MappingRegistry>,
    listeners: RwLock<Vec<ListenerRef>>,
}

impl NodeManager {
    /// Wraps an initialised database.
    pub fn new(
        db: Box<dyn Database>,
        registry: Arc<MappingRegistry>,
        cache_capacity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| NodeManager {
            me: me.clone(),
            db,
            cache: NodeCache::new(cache_capacity),
            registry,
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn db(&self) -> &dyn Database {
        self.db.as_ref()
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.registry
    }

    /// Starts a transaction on the current thread's transactor, creating
    /// the transactor if needed.
    pub fn begin(self: &Arc<Self>, name: &str) -> Result<Arc<Transactor>> {
        let tx = Transactor::bind(self);
        tx.begin(name)?;
        Ok(tx)
    }

    /// Returns the node stored under `key`.
    ///
    /// Inside a transaction, repeated lookups return the same instance.
    /// Concurrent loads converge on the instance that reached the cache
    /// first. Invalidated nodes are reloaded.
    pub fn get_node(&self, key: &DbKey) -> Result<NodeRef> {
        let tx = Transactor::current().filter(|tx| tx.is_bound_to(self));
        if let Some(tx) = &tx {
            let local = tx.get_dirty_node(key).or_else(|| tx.get_clean_node(key));
            if let Some(node) = local.filter(|n| n.state() != NodeState::Invalid) {
                return Ok(node);
            }
        }

        let node = match self.cache.get(key) {
            Some(node) if node.state() != NodeState::Invalid => node,
            _ => {
                let loaded = self.load(key)?;
                self.cache.get_or_insert(key.clone(), loaded)
            }
        };
        if let Some(tx) = tx {
            tx.visit_clean_node(key.clone(), &node);
        }
        Ok(node)
    }

    /// Looks a node up by id alone.
    pub fn get_node_by_id(&self, id: &str) -> Result<NodeRef> {
        self.get_node(&DbKey::embedded(id))
    }

    pub fn root(&self) -> Result<NodeRef> {
        self.get_node_by_id(ROOT_ID)
    }

    pub fn user_root(&self) -> Result<NodeRef> {
        self.get_node_by_id(USER_ROOT_ID)
    }

    fn load(&self, key: &DbKey) -> Result<NodeRef> {
        let reader = RecordReader::new(Some(&self.registry), self.me.clone());
        let node = self.db.get_node(key.id(), &reader)?;
        trace!(key = %key, "loaded node");
        Ok(node)
    }

    /// Puts a committed node into the shared cache.
    pub fn register_node(&self, node: &NodeRef) {
        if let Some(key) = node.key() {
            self.cache.put(key, Arc::clone(node));
        }
    }

    /// Marks `node` invalid and drops it from the cache and from the
    /// current transaction, so the next lookup reloads it.
    pub fn evict_node(&self, node: &Node) {
        let key = node.key();
        node.set_state(NodeState::Invalid);
        if let Some(key) = key {
            self.cache.remove_instance(&key, node);
            if let Some(tx) = Transactor::current() {
                tx.drop_clean_node(&key);
            }
            debug!(key = %key, "evicted node");
        }
    }

    /// Drops whatever is cached under `key`.
    pub fn evict_key(&self, key: &DbKey) {
        if let Some(node) = self.cache.remove(key) {
            node.set_state(NodeState::Invalid);
        }
        if let Some(tx) = Transactor::current() {
            tx.drop_clean_node(key);
        }
    }

    pub fn mapping_for(&self, prototype: &str) -> Option<Arc<DbMapping>> {
        self.registry.get(prototype)
    }

    /// Issues a fresh id for a node of `mapping`.
    pub fn generate_id(&self, mapping: Option<&DbMapping>) -> Result<String> {
        let id = self.db.next_id()?;
        trace!(id = %id, prototype = mapping.map(DbMapping::prototype_name), "generated id");
        Ok(id)
    }

    /// Creates a transient node that persists through this manager.
    pub fn create_node(self: &Arc<Self>, name: Option<&str>, prototype: Option<&str>) -> NodeRef {
        let node = Node::transient(name);
        node.set_manager(self);
        if let Some(prototype) = prototype {
            node.set_prototype(prototype);
        }
        node
    }

    /// Persists a transient node and everything it owns. Requires an active
    /// transaction on the current thread.
    pub fn persist(self: &Arc<Self>, node: &NodeRef) -> Result<()> {
        node.make_persistent(self)
    }

    pub fn add_listener(&self, listener: ListenerRef) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &ListenerRef) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    pub(crate) fn fire_node_change(&self, changes: &NodeChangeSet) {
        if changes.is_empty() {
            return;
        }
        let listeners: Vec<ListenerRef> = self.listeners.read().clone();
        for listener in listeners {
            listener.nodes_changed(changes);
        }
    }

    /// Empties the cache and shuts the database down.
    pub fn shutdown(&self) -> Result<()> {
        self.cache.clear();
        self.db.shutdown()
    }
}
