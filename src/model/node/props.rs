//! Typed property access.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::debug;

use super::{Node, NodeRef};
use crate::error::{Error, Result};
use crate::model::key::NodeHandle;
use crate::model::property::Property;
use crate::model::state::NodeState;
use crate::model::value::{FromValue, OpaqueObject, Value};

/// Properties starting with `_` are internal: never locked, marked or stored.
pub fn is_internal_property(name: &str) -> bool {
    name.starts_with('_')
}

impl Node {
    /// Names of all properties, sorted.
    pub fn properties(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().props.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.inner.read().props.contains_key(name)
    }

    /// The property cell stored under `name`, materialising virtual
    /// relations on a miss.
    pub fn get_property(&self, name: &str) -> Option<Property> {
        if let Some(prop) = self.inner.read().props.get(name) {
            return Some(prop.clone());
        }
        self.materialize_virtual(name)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.get_property(name).map(Property::into_value)
    }

    /// Typed read that returns `None` on absence or any type mismatch.
    pub fn try_get<T: FromValue>(&self, name: &str) -> Option<T> {
        self.get(name).as_ref().and_then(T::from_value)
    }

    /// Reads any literal as a string; node values yield the target's name.
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).and_then(|v| v.to_display_string())
    }

    pub fn get_boolean(&self, name: &str) -> bool {
        self.try_get(name).unwrap_or(false)
    }

    pub fn get_integer(&self, name: &str) -> i64 {
        self.try_get(name).unwrap_or(0)
    }

    pub fn get_float(&self, name: &str) -> f64 {
        self.try_get(name).unwrap_or(0.0)
    }

    pub fn get_date(&self, name: &str) -> Option<OffsetDateTime> {
        self.try_get(name)
    }

    pub fn get_java_object(&self, name: &str) -> Option<OpaqueObject> {
        self.try_get(name)
    }

    /// The node stored under `name`, loading it if only its key is held.
    pub fn get_node(&self, name: &str) -> Option<NodeRef> {
        match self.get(name)? {
            Value::Node(handle) => self.resolve(&handle),
            _ => None,
        }
    }

    /// Like [`Node::get_node`] but ignoring the case of `name`.
    pub(super) fn get_node_ignore_case(&self, name: &str) -> Option<NodeRef> {
        if let Some(node) = self.get_node(name) {
            return Some(node);
        }
        let handle = {
            let inner = self.inner.read();
            inner
                .props
                .values()
                .find(|p| p.name().eq_ignore_ascii_case(name))
                .and_then(|p| match p.value() {
                    Value::Node(handle) => Some(handle.clone()),
                    _ => None,
                })
        };
        handle.and_then(|h| self.resolve(&h))
    }

    /// Resolves `handle` to a node, going through the node manager for keys.
    pub fn resolve_handle(&self, handle: &NodeHandle) -> Result<NodeRef> {
        match handle {
            NodeHandle::Node(node) => Ok(Arc::clone(node)),
            NodeHandle::Key(key) => match self.manager() {
                Some(manager) => manager.get_node(key),
                None => Err(Error::not_found(key.to_string())),
            },
        }
    }

    pub(super) fn resolve(&self, handle: &NodeHandle) -> Option<NodeRef> {
        match self.resolve_handle(handle) {
            Ok(node) => Some(node),
            Err(err) => {
                debug!(node = %self.id(), target = ?handle, error = %err, "unresolvable node reference");
                None
            }
        }
    }

    fn materialize_virtual(&self, name: &str) -> Option<Property> {
        let (mapping, owner_state, manager) = {
            let inner = self.inner.read();
            (inner.mapping.clone()?, inner.state, inner.manager.clone())
        };
        let relation = mapping.property_relation(name)?;
        if !relation.is_virtual() {
            return None;
        }
        let state = if owner_state.is_persistent() {
            NodeState::Virtual
        } else {
            NodeState::Transient
        };
        let mut parts = super::NodeParts::new(
            format!("{}.{}", self.id(), relation.prop_name()),
            state,
        );
        parts.name = Some(relation.prop_name().to_string());
        parts.prototype = relation.prototype().map(str::to_string);
        parts.mapping = relation.virtual_mapping().cloned();
        parts.manager = manager;
        parts.parent = Some(super::ParentLink::Node(self.me.clone()));
        let node = Node::from_parts(parts);

        let mut inner = self.inner.write();
        let prop = inner
            .props
            .entry(name.to_string())
            .or_insert_with(|| Property::new(name, Value::Node(NodeHandle::Node(node))));
        Some(prop.clone())
    }

    /// Stores `value` under `name`.
    ///
    /// Node values are routed through [`Node::set_node`] so that ownership
    /// and persistence are handled the same way as for typed setters.
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        match value {
            Value::Node(NodeHandle::Node(node)) => self.set_node(name, &node),
            other => {
                if !is_internal_property(name) {
                    self.check_write_lock()?;
                }
                self.store(name, other);
                Ok(())
            }
        }
    }

    pub fn set_string(&self, name: &str, value: impl Into<String>) -> Result<()> {
        self.set(name, Value::String(value.into()))
    }

    pub fn set_boolean(&self, name: &str, value: bool) -> Result<()> {
        self.set(name, Value::Boolean(value))
    }

    pub fn set_integer(&self, name: &str, value: i64) -> Result<()> {
        self.set(name, Value::Integer(value))
    }

    pub fn set_float(&self, name: &str, value: f64) -> Result<()> {
        self.set(name, Value::Float(value))
    }

    pub fn set_date(&self, name: &str, value: OffsetDateTime) -> Result<()> {
        self.set(name, Value::date(value))
    }

    pub fn set_java_object(&self, name: &str, value: OpaqueObject) -> Result<()> {
        self.set(name, Value::JavaObject(value))
    }

    /// Stores a node reference under `name`.
    ///
    /// A node without a parent becomes a named child of this node. A
    /// transient node stored on a persistent node is persisted along with
    /// it, unless `name` is declared as a virtual relation.
    pub fn set_node(&self, name: &str, value: &NodeRef) -> Result<()> {
        let internal = is_internal_property(name);
        if !internal {
            self.check_write_lock()?;
        }
        if !self.is_same(value) && value.parent_link().is_none() {
            value.attach_to(self, Some(name), false);
        }
        if !internal && self.state().is_persistent() && value.state() == NodeState::Transient {
            let is_virtual = self
                .mapping()
                .and_then(|m| m.property_relation(name).map(|r| r.is_virtual()))
                .unwrap_or(false);
            if is_virtual {
                value.set_state(NodeState::Virtual);
            } else if let Some(manager) = self.manager() {
                value.make_persistent(&manager)?;
            }
        }
        self.store(name, Value::Node(NodeHandle::for_node(value)));
        Ok(())
    }

    /// Removes the property `name`.
    pub fn unset(&self, name: &str) -> Result<()> {
        let internal = is_internal_property(name);
        if !internal {
            self.check_write_lock()?;
        }
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.props.remove(name).or_else(|| {
                let actual = inner
                    .props
                    .keys()
                    .find(|k| k.eq_ignore_ascii_case(name))
                    .cloned()?;
                inner.props.remove(&actual)
            });
            if removed.is_some() && !internal {
                inner.touch();
            }
            removed
        };
        let Some(removed) = removed else {
            return Ok(());
        };
        if let Value::Node(NodeHandle::Node(target)) = removed.value() {
            if target.is_parent(self) && !target.is_anonymous() {
                target.detach();
            }
        }
        if !internal {
            self.mark_modified();
        }
        Ok(())
    }

    /// Writes `value` into the property map and updates the node's state.
    fn store(&self, name: &str, value: Value) {
        let internal = is_internal_property(name);
        let changed = {
            let mut inner = self.inner.write();
            let changed = match inner.props.get_mut(name) {
                Some(prop) => prop.set(value),
                None => {
                    inner
                        .props
                        .insert(name.to_string(), Property::new(name, value));
                    true
                }
            };
            if changed && !internal {
                inner.touch();
            }
            changed
        };
        if changed && !internal {
            self.mark_modified();
        }
    }
}
