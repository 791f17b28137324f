//! The node entity shared by transient and persistent object graphs.
//!
//! A [`Node`] always lives behind an [`Arc`] ([`NodeRef`]) and keeps a weak
//! pointer to itself so `&self` methods can hand out handles and register
//! with the current transactor. Mutable state sits in one `RwLock`; the
//! write lock that serialises transactors lives in a separate mutex.
//!
//! A node's own lock is never held while calling into the transactor, the
//! node manager or another node.

pub(crate) mod props;
mod tree;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::children::ChildList;
use super::key::{DbKey, NodeHandle};
use super::mapping::DbMapping;
use super::property::Property;
use super::state::NodeState;
use crate::error::{Error, Result};
use crate::manager::{NodeManager, Transactor};

/// Shared pointer to a node.
pub type NodeRef = Arc<Node>;

/// Prototype reported for nodes that never had one assigned.
pub const DEFAULT_PROTOTYPE: &str = "HopObject";

static TRANSIENT_IDS: AtomicU64 = AtomicU64::new(0);

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Non-owning link from a node to the node it is attached to.
#[derive(Debug, Clone)]
pub enum ParentLink {
    /// Parent held in memory.
    Node(Weak<Node>),
    /// Parent known by key.
    Key(DbKey),
}

/// The fields needed to build a node, as produced by the record readers.
#[derive(Debug, Clone)]
pub struct NodeParts {
    pub id: String,
    pub name: Option<String>,
    pub prototype: Option<String>,
    pub state: NodeState,
    pub created: i64,
    pub last_modified: i64,
    pub anonymous: bool,
    pub parent: Option<ParentLink>,
    /// Children in order, each with the name it is indexed under.
    pub children: Vec<(NodeHandle, String)>,
    pub props: Vec<Property>,
    pub mapping: Option<Arc<DbMapping>>,
    pub manager: Weak<NodeManager>,
}

impl NodeParts {
    pub fn new(id: impl Into<String>, state: NodeState) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            name: None,
            prototype: None,
            state,
            created: now,
            last_modified: now,
            anonymous: false,
            parent: None,
            children: Vec::new(),
            props: Vec::new(),
            mapping: None,
            manager: Weak::new(),
        }
    }
}

/// Consistent copy of a node's stored fields, taken under one read lock.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: String,
    pub name: String,
    pub prototype: Option<String>,
    pub state: NodeState,
    pub created: i64,
    pub last_modified: i64,
    pub anonymous: bool,
    pub parent: Option<ParentLink>,
    pub children: Vec<NodeHandle>,
    /// Properties sorted by name.
    pub props: Vec<Property>,
}

struct NodeInner {
    id: String,
    name: Option<String>,
    prototype: Option<String>,
    state: NodeState,
    created: i64,
    last_modified: i64,
    anonymous: bool,
    parent: Option<ParentLink>,
    children: ChildList,
    props: std::collections::HashMap<String, Property>,
    mapping: Option<Arc<DbMapping>>,
    manager: Weak<NodeManager>,
    cache_node: Option<NodeRef>,
}

impl NodeInner {
    fn touch(&mut self) {
        self.last_modified = self.last_modified.max(now_millis());
    }

    fn name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => self.id.clone(),
        }
    }

    fn key(&self) -> Option<DbKey> {
        match self.state {
            NodeState::Transient | NodeState::Virtual => None,
            _ => Some(
                DbKey::for_mapping(self.mapping.as_deref(), self.id.clone())
                    .with_prototype(self.prototype.as_deref()),
            ),
        }
    }
}

/// One addressable entity of the object graph.
pub struct Node {
    me: Weak<Node>,
    inner: RwLock<NodeInner>,
    lock: Mutex<Option<Weak<Transactor>>>,
}

impl Node {
    /// Creates a transient node with an id of the form `t<counter>`.
    ///
    /// A missing or blank `name` makes the node report its id as name.
    pub fn transient(name: Option<&str>) -> NodeRef {
        let id = format!("t{}", TRANSIENT_IDS.fetch_add(1, Ordering::Relaxed));
        let mut parts = NodeParts::new(id, NodeState::Transient);
        parts.name = name.map(str::to_string);
        Self::from_parts(parts)
    }

    /// Builds a node from its parts, e.g. after reading a stored record.
    pub fn from_parts(parts: NodeParts) -> NodeRef {
        let mut children = ChildList::new();
        for (handle, name) in parts.children {
            children.push(handle, &name);
        }
        let props = parts
            .props
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Arc::new_cyclic(|me| Node {
            me: me.clone(),
            inner: RwLock::new(NodeInner {
                id: parts.id,
                name: parts.name,
                prototype: parts.prototype,
                state: parts.state,
                created: parts.created,
                last_modified: parts.last_modified.max(parts.created),
                anonymous: parts.anonymous,
                parent: parts.parent,
                children,
                props,
                mapping: parts.mapping,
                manager: parts.manager,
                cache_node: None,
            }),
            lock: Mutex::new(None),
        })
    }

    fn self_ref(&self) -> Option<NodeRef> {
        self.me.upgrade()
    }

    /// Handle to this node: direct while transient, key-based once stored.
    pub fn handle(&self) -> Option<NodeHandle> {
        self.self_ref().map(|me| NodeHandle::for_node(&me))
    }

    pub fn id(&self) -> String {
        self.inner.read().id.clone()
    }

    /// Display name; falls back to the id when unset or blank.
    pub fn name(&self) -> String {
        self.inner.read().name()
    }

    /// Renames the node and updates the name index of a loaded parent.
    pub fn set_name(&self, name: &str) {
        let display = {
            let mut inner = self.inner.write();
            inner.name = Some(name.to_string());
            inner.touch();
            inner.name()
        };
        let parent = match self.parent_link() {
            Some(ParentLink::Node(parent)) => parent.upgrade(),
            Some(ParentLink::Key(key)) => self.manager().and_then(|m| m.cache().get(&key)),
            None => None,
        };
        if let Some(parent) = parent {
            parent.inner.write().children.rename(self, &display);
        }
    }

    /// Prototype name; unset prototypes read as [`DEFAULT_PROTOTYPE`].
    pub fn prototype(&self) -> String {
        self.inner
            .read()
            .prototype
            .clone()
            .unwrap_or_else(|| DEFAULT_PROTOTYPE.to_string())
    }

    /// The explicitly assigned prototype, if any.
    pub fn declared_prototype(&self) -> Option<String> {
        self.inner.read().prototype.clone()
    }

    /// Assigns the prototype and picks up its mapping from the node manager.
    pub fn set_prototype(&self, prototype: &str) {
        let mapping = self
            .manager()
            .and_then(|m| m.mapping_for(prototype));
        let mut inner = self.inner.write();
        inner.prototype = Some(prototype.to_string());
        if mapping.is_some() {
            inner.mapping = mapping;
        }
    }

    pub fn state(&self) -> NodeState {
        self.inner.read().state
    }

    /// Sets the state without any transactor bookkeeping.
    pub(crate) fn set_state(&self, state: NodeState) {
        self.inner.write().state = state;
    }

    pub fn created(&self) -> i64 {
        self.inner.read().created
    }

    pub fn last_modified(&self) -> i64 {
        self.inner.read().last_modified
    }

    pub fn is_anonymous(&self) -> bool {
        self.inner.read().anonymous
    }

    /// Storage key; `None` for transient and virtual nodes.
    pub fn key(&self) -> Option<DbKey> {
        self.inner.read().key()
    }

    pub fn mapping(&self) -> Option<Arc<DbMapping>> {
        self.inner.read().mapping.clone()
    }

    pub fn set_mapping(&self, mapping: Option<Arc<DbMapping>>) {
        self.inner.write().mapping = mapping;
    }

    pub fn manager(&self) -> Option<Arc<NodeManager>> {
        self.inner.read().manager.upgrade()
    }

    pub(crate) fn set_manager(&self, manager: &Arc<NodeManager>) {
        self.inner.write().manager = Arc::downgrade(manager);
    }

    pub fn parent_link(&self) -> Option<ParentLink> {
        self.inner.read().parent.clone()
    }

    /// The node this one is attached to, loading it if only its key is known.
    pub fn parent(&self) -> Option<NodeRef> {
        match self.parent_link()? {
            ParentLink::Node(parent) => parent.upgrade(),
            ParentLink::Key(key) => {
                let manager = self.manager()?;
                match manager.get_node(&key) {
                    Ok(node) => Some(node),
                    Err(err) => {
                        debug!(node = %self.id(), parent = %key, error = %err, "parent not loadable");
                        None
                    }
                }
            }
        }
    }

    /// Id and prototype of the parent, without loading it.
    pub fn parent_ref(&self) -> Option<(String, Option<String>)> {
        match self.parent_link()? {
            ParentLink::Node(parent) => {
                let parent = parent.upgrade()?;
                let inner = parent.inner.read();
                Some((inner.id.clone(), inner.prototype.clone()))
            }
            ParentLink::Key(key) => Some((
                key.id().to_string(),
                key.prototype().map(str::to_string),
            )),
        }
    }

    fn is_parent(&self, candidate: &Node) -> bool {
        match self.parent_link() {
            Some(ParentLink::Node(parent)) => std::ptr::eq(parent.as_ptr(), candidate),
            Some(ParentLink::Key(key)) => candidate.key().as_ref() == Some(&key),
            None => false,
        }
    }

    /// Records `parent` as the primary attachment point of this node.
    fn attach_to(&self, parent: &Node, name: Option<&str>, anonymous: bool) {
        let link = match parent.key() {
            Some(key) if parent.state().is_persistent() => ParentLink::Key(key),
            _ => ParentLink::Node(parent.me.clone()),
        };
        let mut inner = self.inner.write();
        inner.parent = Some(link);
        inner.anonymous = anonymous;
        if let Some(name) = name {
            inner.name = Some(name.to_string());
        }
    }

    fn detach(&self) {
        let mut inner = self.inner.write();
        inner.parent = None;
        inner.anonymous = false;
    }

    /// Consistent copy of the stored fields.
    pub fn snapshot(&self) -> NodeSnapshot {
        let inner = self.inner.read();
        let mut props: Vec<Property> = inner.props.values().cloned().collect();
        props.sort_by(|a, b| a.name().cmp(b.name()));
        NodeSnapshot {
            id: inner.id.clone(),
            name: inner.name(),
            prototype: inner.prototype.clone(),
            state: inner.state,
            created: inner.created,
            last_modified: inner.last_modified,
            anonymous: inner.anonymous,
            parent: inner.parent.clone(),
            children: inner.children.handles(),
            props,
        }
    }

    /// Replaces key handles in properties, children and the parent link
    /// with the nodes `lookup` finds for them. Timestamps and state are
    /// left alone; used to wire up a freshly read graph.
    pub(crate) fn rebind_references(&self, lookup: &dyn Fn(&DbKey) -> Option<NodeRef>) {
        let (props, children, parent) = {
            let inner = self.inner.read();
            let props: Vec<(String, DbKey)> = inner
                .props
                .iter()
                .filter_map(|(name, p)| match p.value() {
                    crate::model::Value::Node(NodeHandle::Key(key)) => {
                        Some((name.clone(), key.clone()))
                    }
                    _ => None,
                })
                .collect();
            let children: Vec<DbKey> = inner
                .children
                .iter()
                .filter_map(|h| match h {
                    NodeHandle::Key(key) => Some(key.clone()),
                    NodeHandle::Node(_) => None,
                })
                .collect();
            let parent = match &inner.parent {
                Some(ParentLink::Key(key)) => Some(key.clone()),
                _ => None,
            };
            (props, children, parent)
        };
        let props: Vec<_> = props
            .into_iter()
            .filter_map(|(name, key)| lookup(&key).map(|n| (name, NodeHandle::Node(n))))
            .collect();
        let children: Vec<_> = children
            .into_iter()
            .filter_map(|key| lookup(&key).map(|n| (key, NodeHandle::Node(n))))
            .collect();
        let parent = parent.and_then(|key| lookup(&key));

        let mut inner = self.inner.write();
        for (name, handle) in props {
            if let Some(prop) = inner.props.get_mut(&name) {
                prop.set(crate::model::Value::Node(handle));
            }
        }
        for (key, handle) in children {
            inner.children.replace(&NodeHandle::Key(key), handle);
        }
        if let Some(parent) = parent {
            inner.parent = Some(ParentLink::Node(Arc::downgrade(&parent)));
        }
    }

    /// True if `other` is this very instance.
    pub fn is_same(&self, other: &NodeRef) -> bool {
        std::ptr::eq(self, Arc::as_ptr(other))
    }

    // ---- write lock and state bookkeeping ----

    /// Ensures the current thread's transactor may modify this node and
    /// registers the node as dirty.
    ///
    /// Transient and virtual nodes need no lock.
    pub fn check_write_lock(&self) -> Result<()> {
        let state = self.state();
        if matches!(state, NodeState::Transient | NodeState::Virtual) {
            return Ok(());
        }
        let tx = Transactor::current().ok_or(Error::NoTransactor)?;
        if !tx.is_active() {
            return Err(Error::TransactionInactive);
        }
        if state == NodeState::Invalid {
            warn!(node = %self.id(), "write attempt on invalidated node");
            return Err(Error::ConcurrencyConflict(format!(
                "node {} was invalidated by another thread",
                self.id()
            )));
        }
        {
            let mut lock = self.lock.lock();
            if let Some(holder) = lock.as_ref().and_then(Weak::upgrade) {
                if !Arc::ptr_eq(&holder, &tx) && holder.is_alive() && holder.is_active() {
                    return Err(Error::ConcurrencyConflict(format!(
                        "node {} is locked by transactor {}",
                        self.id(),
                        holder.name()
                    )));
                }
            }
            *lock = Some(Arc::downgrade(&tx));
        }
        if let Some(me) = self.self_ref() {
            tx.visit_dirty_node(&me);
        }
        Ok(())
    }

    pub(crate) fn clear_write_lock(&self) {
        *self.lock.lock() = None;
    }

    /// True if `tx` currently holds this node's write lock.
    pub fn is_locked_by(&self, tx: &Arc<Transactor>) -> bool {
        self.lock
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|holder| Arc::ptr_eq(&holder, tx))
    }

    /// Moves the node to `state`, registering it with the current
    /// transactor. Transient, virtual and invalid nodes are left alone.
    pub fn mark_as(&self, state: NodeState) {
        {
            let mut inner = self.inner.write();
            if inner.state == state || inner.state.is_pinned() {
                return;
            }
            inner.state = state;
        }
        let Some(tx) = Transactor::current() else {
            return;
        };
        let Some(me) = self.self_ref() else {
            return;
        };
        match state {
            NodeState::Clean => {
                self.clear_write_lock();
                tx.drop_dirty_node(&me);
            }
            NodeState::New => {
                tx.visit_dirty_node(&me);
                self.clear_write_lock();
                if let Some(key) = self.key() {
                    tx.visit_clean_node(key, &me);
                }
            }
            _ => tx.visit_dirty_node(&me),
        }
    }

    /// Flips a clean node to modified after a mutation.
    fn mark_modified(&self) {
        if self.state() == NodeState::Clean {
            self.mark_as(NodeState::Modified);
        }
    }

    /// Tells the transactor that this node's child list changed.
    fn register_subnode_change(&self) {
        if matches!(self.state(), NodeState::Transient | NodeState::New) {
            return;
        }
        if let (Some(tx), Some(me)) = (Transactor::current(), self.self_ref()) {
            tx.visit_parent_node(&me);
        }
    }

    /// Drops this node from memory so the next access reloads it.
    ///
    /// No-op for transient and new nodes.
    pub fn invalidate(&self) -> Result<()> {
        if matches!(self.state(), NodeState::Transient | NodeState::New) {
            return Ok(());
        }
        self.check_write_lock()?;
        match self.manager() {
            Some(manager) => manager.evict_node(self),
            None => self.set_state(NodeState::Invalid),
        }
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Node")
            .field("id", &inner.id)
            .field("name", &inner.name())
            .field("prototype", &inner.prototype)
            .field("state", &inner.state)
            .field("children", &inner.children.len())
            .field("props", &inner.props.len())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        write!(
            f,
            "HopObject {} ({})",
            inner.name(),
            inner.prototype.as_deref().unwrap_or(DEFAULT_PROTOTYPE)
        )
    }
}
