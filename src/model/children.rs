use std::collections::HashMap;

use super::key::NodeHandle;
use super::node::Node;

#[derive(Debug, Clone)]
struct ChildEntry {
    name_key: String,
    handle: NodeHandle,
}

/// Ordered child sequence of a node plus its case-insensitive name index.
///
/// All mutation goes through this type so that the index and the sequence
/// never disagree: every index entry is a handle stored in the sequence
/// under that name, and every name in the sequence has an index entry.
#[derive(Debug, Clone, Default)]
pub struct ChildList {
    entries: Vec<ChildEntry>,
    by_name: HashMap<String, NodeHandle>,
}

impl ChildList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&NodeHandle> {
        self.entries.get(index).map(|e| &e.handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeHandle> {
        self.entries.iter().map(|e| &e.handle)
    }

    pub fn handles(&self) -> Vec<NodeHandle> {
        self.iter().cloned().collect()
    }

    /// Child registered under `name`, compared case-insensitively.
    pub fn lookup(&self, name: &str) -> Option<&NodeHandle> {
        self.by_name.get(&name.to_lowercase())
    }

    pub fn position(&self, handle: &NodeHandle) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.handle.same_target(handle))
    }

    pub fn position_of(&self, node: &Node) -> Option<usize> {
        self.entries.iter().position(|e| e.handle.refers_to(node))
    }

    /// Inserts `handle` under `name` at `position` (clamped to the current
    /// length). A child that is already present is moved, not duplicated.
    ///
    /// Returns the index the child ended up at.
    pub fn insert(&mut self, handle: NodeHandle, name: &str, position: usize) -> usize {
        let name_key = name.to_lowercase();
        if let Some(old) = self.position(&handle) {
            let entry = self.entries.remove(old);
            self.unindex(&entry);
        }
        let at = position.min(self.entries.len());
        self.by_name.insert(name_key.clone(), handle.clone());
        self.entries.insert(at, ChildEntry { name_key, handle });
        at
    }

    /// Appends `handle` under `name`; moves it to the end if present.
    pub fn push(&mut self, handle: NodeHandle, name: &str) -> usize {
        self.insert(handle, name, usize::MAX)
    }

    /// Removes the entry for `handle`, returning its former position.
    pub fn remove(&mut self, handle: &NodeHandle) -> Option<usize> {
        let at = self.position(handle)?;
        let entry = self.entries.remove(at);
        self.unindex(&entry);
        Some(at)
    }

    /// Replaces the handle stored for a child with `replacement`, keeping
    /// its position and name. Used when a child switches from a direct
    /// reference to a key after becoming persistent.
    pub fn replace(&mut self, current: &NodeHandle, replacement: NodeHandle) -> bool {
        let Some(at) = self.position(current) else {
            return false;
        };
        let entry = &mut self.entries[at];
        entry.handle = replacement.clone();
        let name_key = entry.name_key.clone();
        if self
            .by_name
            .get(&name_key)
            .is_some_and(|h| h.same_target(current))
        {
            self.by_name.insert(name_key, replacement);
        }
        true
    }

    /// Moves the index entry of `node` to `name` after the node was renamed.
    /// Returns false if `node` is not a child or already indexed as `name`.
    pub fn rename(&mut self, node: &Node, name: &str) -> bool {
        let Some(at) = self.position_of(node) else {
            return false;
        };
        let name_key = name.to_lowercase();
        if self.entries[at].name_key == name_key {
            return false;
        }
        let old = ChildEntry {
            name_key: std::mem::replace(&mut self.entries[at].name_key, name_key.clone()),
            handle: self.entries[at].handle.clone(),
        };
        self.unindex(&old);
        self.by_name.insert(name_key, old.handle);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_name.clear();
    }

    fn unindex(&mut self, removed: &ChildEntry) {
        let indexed_here = self
            .by_name
            .get(&removed.name_key)
            .is_some_and(|h| h.same_target(&removed.handle));
        if !indexed_here {
            return;
        }
        match self
            .entries
            .iter()
            .rev()
            .find(|e| e.name_key == removed.name_key)
        {
            Some(other) => {
                self.by_name
                    .insert(removed.name_key.clone(), other.handle.clone());
            }
            None => {
                self.by_name.remove(&removed.name_key);
            }
        }
    }

    /// Panics if the sequence and the name index disagree.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (name, handle) in &self.by_name {
            assert!(
                self.entries
                    .iter()
                    .any(|e| &e.name_key == name && same_identity(&e.handle, handle)),
                "index entry {name} has no matching child"
            );
        }
        for entry in &self.entries {
            assert!(
                self.by_name.contains_key(&entry.name_key),
                "child {} missing from index",
                entry.name_key
            );
        }
        for (i, a) in self.entries.iter().enumerate() {
            for b in &self.entries[i + 1..] {
                assert!(!a.handle.same_target(&b.handle), "duplicate child");
            }
        }
    }
}

#[cfg(test)]
fn same_identity(a: &NodeHandle, b: &NodeHandle) -> bool {
    match (a, b) {
        (NodeHandle::Node(x), NodeHandle::Node(y)) => std::sync::Arc::ptr_eq(x, y),
        (NodeHandle::Key(x), NodeHandle::Key(y)) => x == y,
        _ => false,
    }
}
