use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::model::{DbKey, Node, NodeRef, NodeState};

/// Default number of nodes kept in memory.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Shared LRU cache of loaded nodes, keyed by [`DbKey`].
///
/// All operations take one short mutex. Nodes never call back into the
/// cache, so reading a node's state under it cannot deadlock.
pub struct NodeCache {
    inner: Mutex<LruCache<DbKey, NodeRef>>,
}

impl NodeCache {
    /// Creates a cache holding at most `capacity` nodes (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &DbKey) -> Option<NodeRef> {
        self.inner.lock().get(key).cloned()
    }

    /// Stores `node`, returning the node it replaced.
    pub fn put(&self, key: DbKey, node: NodeRef) -> Option<NodeRef> {
        self.inner.lock().put(key, node)
    }

    /// Returns the cached node for `key` unless it was invalidated, and
    /// caches `node` otherwise. Concurrent loads of one key converge on the
    /// first instance that made it into the cache.
    pub fn get_or_insert(&self, key: DbKey, node: NodeRef) -> NodeRef {
        let mut inner = self.inner.lock();
        match inner.get(&key).cloned() {
            Some(existing) if existing.state() != NodeState::Invalid => existing,
            _ => {
                inner.put(key, Arc::clone(&node));
                node
            }
        }
    }

    pub fn remove(&self, key: &DbKey) -> Option<NodeRef> {
        self.inner.lock().pop(key)
    }

    /// Removes the entry for `key` only if it is `node` itself.
    pub fn remove_instance(&self, key: &DbKey, node: &Node) -> bool {
        let mut inner = self.inner.lock();
        match inner.peek(key) {
            Some(cached) if std::ptr::eq(Arc::as_ptr(cached), node) => {
                inner.pop(key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &DbKey) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
