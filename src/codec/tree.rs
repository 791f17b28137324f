//! Rebuilds a whole document into a transient node graph.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::reader::{entries, node_parts, Entry};
use super::{parse_document, record_element, Element, HOP_CHILD};
use crate::error::Result;
use crate::model::{
    DbKey, MappingRegistry, Node, NodeHandle, NodeRef, NodeState, ParentLink, Property, Value,
};

/// Looks up nodes that a document references but does not contain.
pub type Resolver<'a> = &'a dyn Fn(&DbKey) -> Option<NodeRef>;

/// Reads documents written with [`super::WriterOptions::tree`] back into
/// transient nodes.
///
/// Inlined nodes become nodes, references resolve against nodes read
/// earlier in the same document, then against the optional resolver, and
/// otherwise stay key handles.
#[derive(Default)]
pub struct TreeReader<'a> {
    registry: Option<&'a MappingRegistry>,
    resolver: Option<Resolver<'a>>,
}

impl<'a> TreeReader<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(mut self, registry: &'a MappingRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_resolver(mut self, resolver: Resolver<'a>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn read_file(&self, path: &Path) -> Result<NodeRef> {
        let xml = fs::read_to_string(path)?;
        self.read_str(&xml, path)
    }

    pub fn read_str(&self, xml: &str, source: &Path) -> Result<NodeRef> {
        let root = parse_document(xml, source)?;
        let record = record_element(&root, source)?;
        let mut by_id: HashMap<String, NodeRef> = HashMap::new();
        let node = self.build(record, None, source, &mut by_id)?;

        let lookup = |key: &DbKey| {
            by_id
                .get(key.id())
                .cloned()
                .or_else(|| self.resolver.and_then(|resolve| resolve(key)))
        };
        for read in by_id.values() {
            read.rebind_references(&lookup);
        }
        Ok(node)
    }

    fn build(
        &self,
        element: &Element,
        container: Option<&str>,
        source: &Path,
        by_id: &mut HashMap<String, NodeRef>,
    ) -> Result<NodeRef> {
        let mut parts = node_parts(element, NodeState::Transient, source)?;
        if let Some(prototype) = parts.prototype.as_deref() {
            parts.mapping = self.registry.and_then(|r| r.get(prototype));
        }
        for entry in entries(element, self.registry, source)? {
            match entry {
                Entry::Parent(key) => parts.parent = Some(ParentLink::Key(key)),
                Entry::Child(handle, name) => parts.children.push((handle, name)),
                Entry::Property(prop) => parts.props.push(prop),
                Entry::Inline { element: inline, prop_name } => {
                    let node = self.build(inline, Some(parts.id.as_str()), source, by_id)?;
                    let handle = NodeHandle::Node(node.clone());
                    match prop_name {
                        Some(name) => parts.props.push(Property::new(name, Value::Node(handle))),
                        None => parts.children.push((handle, node.name())),
                    }
                }
            }
        }
        if element.attr("anonymous").is_none() && element.name == HOP_CHILD {
            let parent_id = match &parts.parent {
                Some(ParentLink::Key(key)) => Some(key.id()),
                _ => None,
            };
            parts.anonymous = parent_id.is_some() && parent_id == container;
        }
        let id = parts.id.clone();
        let node = Node::from_parts(parts);
        by_id.insert(id, node.clone());
        Ok(node)
    }
}
