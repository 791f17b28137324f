use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::mapping::DbMapping;
use super::node::{Node, NodeRef};

/// Structural key of a persistent node.
///
/// All storage spaces share one id space, so two keys are equal when their
/// ids are equal. `storage` (`None` for the embedded store) and the
/// prototype hint travel with the key for display and for writing
/// references but take no part in equality or hashing.
#[derive(Debug, Clone)]
pub struct DbKey {
    storage: Option<Arc<str>>,
    id: String,
    prototype: Option<Arc<str>>,
}

impl DbKey {
    pub fn new(storage: Option<&str>, id: impl Into<String>) -> Self {
        Self {
            storage: storage.map(Arc::from),
            id: id.into(),
            prototype: None,
        }
    }

    /// Attaches the prototype of the node this key points to.
    pub fn with_prototype(mut self, prototype: Option<&str>) -> Self {
        self.prototype = prototype.map(Arc::from);
        self
    }

    /// Key in the embedded store's id space.
    pub fn embedded(id: impl Into<String>) -> Self {
        Self::new(None, id)
    }

    /// Key for `id` under the storage space defined by `mapping`.
    pub fn for_mapping(mapping: Option<&DbMapping>, id: impl Into<String>) -> Self {
        Self::new(mapping.and_then(|m| m.storage_type_name()), id)
            .with_prototype(mapping.map(|m| m.prototype_name()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn storage_name(&self) -> Option<&str> {
        self.storage.as_deref()
    }

    pub fn prototype(&self) -> Option<&str> {
        self.prototype.as_deref()
    }
}

impl PartialEq for DbKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DbKey {}

impl Hash for DbKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.storage {
            Some(storage) => write!(f, "{storage}[{}]", self.id),
            None => write!(f, "[{}]", self.id),
        }
    }
}

/// Reference to a node that is either held directly or looked up by key.
///
/// Transient nodes can only be referenced directly. Persistent nodes are
/// referenced by key so an evicted and reloaded node is picked up by every
/// holder of the handle.
#[derive(Clone)]
pub enum NodeHandle {
    Node(NodeRef),
    Key(DbKey),
}

impl NodeHandle {
    /// Handle for `node`: direct while transient, by key once persistent.
    pub fn for_node(node: &NodeRef) -> Self {
        match node.key() {
            Some(key) if node.state().is_persistent() => NodeHandle::Key(key),
            _ => NodeHandle::Node(Arc::clone(node)),
        }
    }

    pub fn id(&self) -> String {
        match self {
            NodeHandle::Node(node) => node.id(),
            NodeHandle::Key(key) => key.id().to_string(),
        }
    }

    pub fn key(&self) -> Option<DbKey> {
        match self {
            NodeHandle::Node(node) => node.key(),
            NodeHandle::Key(key) => Some(key.clone()),
        }
    }

    /// The node if it is held directly.
    pub fn loaded(&self) -> Option<&NodeRef> {
        match self {
            NodeHandle::Node(node) => Some(node),
            NodeHandle::Key(_) => None,
        }
    }

    /// Name used for lenient string conversion of node values.
    pub fn display_name(&self) -> String {
        match self {
            NodeHandle::Node(node) => node.name(),
            NodeHandle::Key(key) => key.id().to_string(),
        }
    }

    /// True if both handles denote the same node.
    pub fn same_target(&self, other: &NodeHandle) -> bool {
        match (self, other) {
            (NodeHandle::Node(a), NodeHandle::Node(b)) => Arc::ptr_eq(a, b),
            (NodeHandle::Key(a), NodeHandle::Key(b)) => a == b,
            (NodeHandle::Node(n), NodeHandle::Key(k)) | (NodeHandle::Key(k), NodeHandle::Node(n)) => {
                n.state().is_persistent() && n.key().as_ref() == Some(k)
            }
        }
    }

    /// True if this handle refers to `node`.
    pub fn refers_to(&self, node: &Node) -> bool {
        match self {
            NodeHandle::Node(held) => std::ptr::eq(Arc::as_ptr(held), node),
            NodeHandle::Key(key) => node.state().is_persistent() && node.key().as_ref() == Some(key),
        }
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeHandle::Node(node) => write!(f, "NodeHandle[transient:{}]", node.id()),
            NodeHandle::Key(key) => write!(f, "NodeHandle[{key}]"),
        }
    }
}
