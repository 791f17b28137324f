//! Child management, paths, removal and persistence of node graphs.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{Node, NodeRef, ParentLink};
use crate::error::{Error, Result};
use crate::manager::{NodeManager, Transactor};
use crate::model::key::NodeHandle;
use crate::model::state::NodeState;
use crate::model::value::Value;

/// Upper bound on parent hops when computing paths.
const MAX_PATH_DEPTH: usize = 64;

impl Node {
    pub fn number_of_nodes(&self) -> usize {
        self.inner.read().children.len()
    }

    pub fn subnode_handles(&self) -> Vec<NodeHandle> {
        self.inner.read().children.handles()
    }

    /// Children in order. Children that cannot be loaded are skipped.
    pub fn subnodes(&self) -> Vec<NodeRef> {
        self.subnode_handles()
            .iter()
            .filter_map(|h| self.resolve(h))
            .collect()
    }

    pub fn get_subnode_at(&self, index: usize) -> Option<NodeRef> {
        let handle = self.inner.read().children.get(index).cloned()?;
        self.resolve(&handle)
    }

    /// Position of `node` among the children.
    pub fn contains(&self, node: &Node) -> Option<usize> {
        self.inner.read().children.position_of(node)
    }

    /// Attaches `child` as a positional child at `position` (end if `None`,
    /// clamped to the current length). A child that is already attached is
    /// moved instead of added twice.
    pub fn add_node(&self, child: &NodeRef, position: Option<usize>) -> Result<NodeRef> {
        if self.is_same(child) {
            return Err(Error::InvalidArgument(format!(
                "cannot add node {} to itself",
                self.id()
            )));
        }
        let name = child.name();
        if name.contains('/') {
            return Err(Error::InvalidArgument(format!(
                "node name {name:?} must not contain '/'"
            )));
        }
        self.check_write_lock()?;
        if child.parent_link().is_none() {
            child.attach_to(self, None, true);
        }
        if self.state().is_persistent() && child.state() == NodeState::Transient {
            if let Some(manager) = self.manager() {
                child.make_persistent(&manager)?;
            }
        }
        let handle = NodeHandle::for_node(child);
        {
            let mut inner = self.inner.write();
            inner
                .children
                .insert(handle, &name, position.unwrap_or(usize::MAX));
            inner.touch();
        }
        self.mark_modified();
        self.register_subnode_change();
        Ok(Arc::clone(child))
    }

    /// Creates a child node. A non-blank `name` attaches it as a named
    /// property, otherwise it becomes an anonymous positional child.
    pub fn create_node(&self, name: Option<&str>, position: Option<usize>) -> Result<NodeRef> {
        let name = name.filter(|n| !n.trim().is_empty());
        let node = Node::transient(name);
        let (manager, mapping) = {
            let inner = self.inner.read();
            (inner.manager.clone(), inner.mapping.clone())
        };
        node.inner.write().manager = manager;
        if let Some(proto) = mapping.as_ref().and_then(|m| m.subnode_prototype()) {
            node.set_prototype(proto);
        }
        match name {
            Some(name) => self.set_node(name, &node)?,
            None => {
                self.add_node(&node, position)?;
            }
        }
        Ok(node)
    }

    /// Resolves a `/`-separated path below this node, ignoring case.
    ///
    /// Each segment is looked up among the named children first and then
    /// among node-valued properties. Empty segments resolve to this node.
    pub fn get_subnode(&self, path: &str) -> Option<NodeRef> {
        let me = self.self_ref()?;
        let mut current = Arc::clone(&me);
        for segment in path.split('/') {
            let segment = segment.trim().to_lowercase();
            if segment.is_empty() {
                current = Arc::clone(&me);
                continue;
            }
            let handle = current.inner.read().children.lookup(&segment).cloned();
            let next = match handle {
                Some(handle) => current.resolve(&handle),
                None => None,
            };
            current = match next {
                Some(node) => node,
                None => current.get_node_ignore_case(&segment)?,
            };
        }
        Some(current)
    }

    /// Detaches `child` from this node.
    ///
    /// Anonymous children owned by this node are removed recursively and,
    /// when stored, marked deleted. Shared or named nodes are only unlinked.
    pub fn remove_node(&self, child: &Node) -> Result<()> {
        self.check_write_lock()?;
        let removed = {
            let mut inner = self.inner.write();
            let at = inner.children.position_of(child);
            if let Some(at) = at {
                if let Some(handle) = inner.children.get(at).cloned() {
                    inner.children.remove(&handle);
                }
                inner.touch();
            }
            at.is_some()
        };
        if removed {
            self.mark_modified();
            self.register_subnode_change();
        }
        if child.is_parent(self) && child.is_anonymous() {
            child.detach();
            child.deep_remove()?;
        }
        Ok(())
    }

    /// Detaches this node from its parent and, if stored, deletes it
    /// together with its anonymous children.
    pub fn remove(&self) -> Result<()> {
        if let Some(parent) = self.parent() {
            if self.is_anonymous() {
                return parent.remove_node(self);
            }
            let name = self.name();
            let owns_property = parent
                .get(&name)
                .is_some_and(|v| matches!(&v, Value::Node(h) if h.refers_to(self)));
            if owns_property {
                parent.unset(&name)?;
            } else {
                parent.remove_node(self)?;
            }
        }
        self.detach();
        self.deep_remove()
    }

    /// Removes owned anonymous children and marks stored nodes deleted.
    fn deep_remove(&self) -> Result<()> {
        let children: Vec<NodeRef> = self
            .subnodes()
            .into_iter()
            .filter(|c| c.is_parent(self) && c.is_anonymous())
            .collect();
        for child in children {
            self.remove_node(&child)?;
        }
        let state = self.state();
        if state.is_persistent() && state != NodeState::Deleted {
            self.check_write_lock()?;
            self.mark_as(NodeState::Deleted);
            debug!(node = %self.id(), "marked deleted");
        }
        Ok(())
    }

    /// Names from the top of the parent chain down to this node, joined
    /// with `/`. Anonymous nodes contribute their id.
    pub fn path(&self) -> String {
        self.full_name(None)
    }

    /// Like [`Node::path`], but stops below `root` when it is an ancestor.
    pub fn full_name(&self, root: Option<&Node>) -> String {
        let mut segments = vec![self.element_name()];
        let mut current = self.parent();
        while let Some(node) = current {
            if root.is_some_and(|r| std::ptr::eq(r, Arc::as_ptr(&node))) {
                break;
            }
            if segments.len() >= MAX_PATH_DEPTH {
                warn!(node = %self.id(), "parent chain too deep, truncating path");
                break;
            }
            if node.parent_link().is_none() {
                break;
            }
            segments.push(node.element_name());
            current = node.parent();
        }
        segments.reverse();
        segments.join("/")
    }

    fn element_name(&self) -> String {
        let inner = self.inner.read();
        if inner.anonymous {
            inner.id.clone()
        } else {
            inner.name()
        }
    }

    /// Private transient scratch node, created on first use.
    pub fn cache_node(&self) -> NodeRef {
        let mut inner = self.inner.write();
        Arc::clone(
            inner
                .cache_node
                .get_or_insert_with(|| Node::transient(Some("cache"))),
        )
    }

    pub fn clear_cache_node(&self) {
        self.inner.write().cache_node = None;
    }

    /// Persists this transient node and everything it owns through its
    /// node manager. Requires an active transactor on the current thread.
    pub fn persist(&self) -> Result<()> {
        let manager = self
            .manager()
            .ok_or_else(|| Error::InvalidArgument(format!("node {} has no node manager", self.id())))?;
        self.make_persistent(&manager)
    }

    /// Turns a transient node into a new persistent one with an id from
    /// `manager`, then does the same for transient children and node
    /// properties. Properties declared as virtual relations become virtual.
    pub(crate) fn make_persistent(&self, manager: &Arc<NodeManager>) -> Result<()> {
        if self.state() != NodeState::Transient {
            return Ok(());
        }
        let tx = Transactor::current().ok_or(Error::NoTransactor)?;
        if !tx.is_active() {
            return Err(Error::TransactionInactive);
        }
        let prototype = self.declared_prototype();
        let mut mapping = self.mapping();
        if mapping.is_none() {
            mapping = prototype.as_deref().and_then(|p| manager.mapping_for(p));
        }
        let id = manager.generate_id(mapping.as_deref())?;
        {
            let mut inner = self.inner.write();
            inner.id = id;
            inner.state = NodeState::New;
            inner.manager = Arc::downgrade(manager);
            inner.mapping = mapping.clone();
        }
        self.rebind_parent_link();
        if let (Some(me), Some(key)) = (self.self_ref(), self.key()) {
            tx.visit_dirty_node(&me);
            tx.visit_clean_node(key, &me);
        }
        debug!(node = %self.id(), prototype = ?prototype, "persisted transient node");

        let (props, children) = {
            let inner = self.inner.read();
            let props: Vec<(String, NodeRef)> = inner
                .props
                .iter()
                .filter_map(|(name, p)| match p.value() {
                    Value::Node(NodeHandle::Node(n)) => Some((name.clone(), Arc::clone(n))),
                    _ => None,
                })
                .collect();
            let children: Vec<NodeRef> = inner
                .children
                .iter()
                .filter_map(|h| h.loaded().cloned())
                .collect();
            (props, children)
        };

        for (name, target) in props {
            if crate::model::node::props::is_internal_property(&name) {
                continue;
            }
            let is_virtual = mapping
                .as_ref()
                .and_then(|m| m.property_relation(&name).map(|r| r.is_virtual()))
                .unwrap_or(false);
            if is_virtual {
                if target.state() == NodeState::Transient {
                    target.set_state(NodeState::Virtual);
                }
                continue;
            }
            target.make_persistent(manager)?;
            let handle = NodeHandle::for_node(&target);
            if let Some(prop) = self.inner.write().props.get_mut(&name) {
                prop.replace(Value::Node(handle));
            }
        }
        for child in children {
            let old = NodeHandle::Node(Arc::clone(&child));
            child.make_persistent(manager)?;
            let new = NodeHandle::for_node(&child);
            self.inner.write().children.replace(&old, new);
        }
        Ok(())
    }

    /// Switches an in-memory parent link to a key once the parent is stored.
    fn rebind_parent_link(&self) {
        let Some(ParentLink::Node(parent)) = self.parent_link() else {
            return;
        };
        let Some(parent) = parent.upgrade() else {
            return;
        };
        if !parent.state().is_persistent() {
            return;
        }
        if let Some(key) = parent.key() {
            self.inner.write().parent = Some(ParentLink::Key(key));
        }
    }
}
