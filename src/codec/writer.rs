//! Serialises node graphs into the XML record format.

use std::collections::HashSet;
use std::io::Write;

use quick_xml::escape::escape;

use super::date::format_date;
use super::{HOP_CHILD, HOP_PARENT, NAMESPACE, STYLESHEET};
use crate::error::Result;
use crate::model::node::props::is_internal_property;
use crate::model::{DbKey, Node, NodeHandle, NodeRef, NodeState, ParentLink, Property, Value};
use crate::model::value::format_float;

const INDENT: &str = "  ";

/// Prototype written for nodes without one.
const FALLBACK_PROTOTYPE: &str = "hopobject";

/// Options controlling how much of a graph is written.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Nesting depth past which nodes are written as references.
    pub max_levels: usize,
    /// Skips internal (`_`) properties and virtual nodes.
    pub db_mode: bool,
    /// Encoding named in the XML declaration.
    pub encoding: Option<String>,
}

impl WriterOptions {
    /// One record per node, as stored by the embedded database.
    pub fn database(encoding: Option<String>) -> Self {
        Self {
            max_levels: 1,
            db_mode: true,
            encoding,
        }
    }

    /// A whole transient graph in one document.
    pub fn tree(max_levels: usize) -> Self {
        Self {
            max_levels,
            db_mode: false,
            encoding: None,
        }
    }
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self::tree(usize::MAX)
    }
}

/// Streaming XML writer for nodes.
pub struct XmlWriter<W: Write> {
    out: W,
    options: WriterOptions,
    visited: HashSet<usize>,
    root_transient: bool,
}

impl<W: Write> XmlWriter<W> {
    pub fn new(out: W, options: WriterOptions) -> Self {
        Self {
            out,
            options,
            visited: HashSet::new(),
            root_transient: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Writes a complete document with `node` as its `hopobject` element.
    pub fn write(&mut self, node: &NodeRef) -> Result<()> {
        self.root_transient = node.state() == NodeState::Transient;
        self.visited.clear();
        match &self.options.encoding {
            Some(encoding) => writeln!(
                self.out,
                "<?xml version=\"1.0\" encoding=\"{}\"?>",
                escape(encoding.as_str())
            )?,
            None => writeln!(self.out, "<?xml version=\"1.0\"?>")?,
        }
        writeln!(
            self.out,
            "<?xml-stylesheet type=\"text/xsl\" href=\"{STYLESHEET}\"?>"
        )?;
        writeln!(self.out, "<xmlroot xmlns:hop=\"{NAMESPACE}\">")?;
        self.write_node(node, None, None, 0)?;
        writeln!(self.out, "</xmlroot>")?;
        self.out.flush()?;
        self.visited.clear();
        Ok(())
    }

    fn write_node(
        &mut self,
        node: &NodeRef,
        element: Option<&str>,
        prop_name: Option<&str>,
        level: usize,
    ) -> Result<()> {
        let level = level + 1;
        let identity = std::sync::Arc::as_ptr(node) as usize;
        let downgrade = self.root_transient && node.state().is_persistent();
        if level > self.options.max_levels || self.visited.contains(&identity) || downgrade {
            return self.write_node_reference(node, element, prop_name, level);
        }
        self.visited.insert(identity);

        let snap = node.snapshot();
        let tag = element.unwrap_or("hopobject");
        let prefix = INDENT.repeat(level);
        write!(self.out, "{prefix}<{tag} id=\"{}\"", escape(snap.id.as_str()))?;
        if let Some(prop_name) = prop_name {
            write!(self.out, " propertyname=\"{}\"", escape(prop_name))?;
        }
        write!(
            self.out,
            " name=\"{}\" prototype=\"{}\" created=\"{}\" lastModified=\"{}\"",
            escape(snap.name.as_str()),
            escape(prototype_attr(snap.prototype.as_deref())),
            snap.created,
            snap.last_modified
        )?;
        if snap.anonymous {
            write!(self.out, " anonymous=\"true\"")?;
        }
        writeln!(self.out, ">")?;

        if let Some(parent) = &snap.parent {
            self.write_parent(parent, level)?;
        }
        for prop in &snap.props {
            self.write_property(prop, level)?;
        }
        for child in &snap.children {
            match child {
                NodeHandle::Node(child) => {
                    if self.options.db_mode && child.state() == NodeState::Virtual {
                        continue;
                    }
                    self.write_node(child, Some(HOP_CHILD), None, level)?;
                }
                NodeHandle::Key(key) => self.write_key_reference(key, HOP_CHILD, None, level + 1)?,
            }
        }
        writeln!(self.out, "{prefix}</{tag}>")?;
        Ok(())
    }

    fn write_parent(&mut self, parent: &ParentLink, level: usize) -> Result<()> {
        match parent {
            ParentLink::Node(weak) => {
                if let Some(parent) = weak.upgrade() {
                    self.write_node_reference(&parent, Some(HOP_PARENT), None, level + 1)?;
                }
            }
            ParentLink::Key(key) => self.write_key_reference(key, HOP_PARENT, None, level + 1)?,
        }
        Ok(())
    }

    fn write_property(&mut self, prop: &Property, level: usize) -> Result<()> {
        let name = prop.name();
        if self.options.db_mode && is_internal_property(name) {
            return Ok(());
        }
        let (element, prop_name) = if is_valid_element_name(name) {
            (name, None)
        } else {
            ("property", Some(name))
        };
        let (type_attr, text) = match prop.value() {
            Value::Node(NodeHandle::Node(target)) => {
                if self.options.db_mode && target.state() == NodeState::Virtual {
                    return Ok(());
                }
                return self.write_node(target, Some(element), prop_name, level);
            }
            Value::Node(NodeHandle::Key(key)) => {
                return self.write_key_reference(key, element, prop_name, level + 1);
            }
            Value::JavaObject(_) => return Ok(()),
            Value::String(s) => (None, escape(s.as_str()).into_owned()),
            Value::Boolean(b) => (Some("boolean"), b.to_string()),
            Value::Integer(i) => (Some("integer"), i.to_string()),
            Value::Float(f) => (Some("float"), format_float(*f)),
            Value::Date(d) => (Some("date"), format_date(*d)?),
        };
        let prefix = INDENT.repeat(level + 1);
        write!(self.out, "{prefix}<{element}")?;
        if let Some(prop_name) = prop_name {
            write!(self.out, " propertyname=\"{}\"", escape(prop_name))?;
        }
        if let Some(type_attr) = type_attr {
            write!(self.out, " type=\"{type_attr}\"")?;
        }
        writeln!(self.out, ">{text}</{element}>")?;
        Ok(())
    }

    fn write_node_reference(
        &mut self,
        node: &Node,
        element: Option<&str>,
        prop_name: Option<&str>,
        level: usize,
    ) -> Result<()> {
        let id = node.id();
        let prototype = node.declared_prototype();
        self.write_reference(
            element.unwrap_or("hopobject"),
            &id,
            prototype.as_deref(),
            prop_name,
            level,
        )
    }

    fn write_key_reference(
        &mut self,
        key: &DbKey,
        element: &str,
        prop_name: Option<&str>,
        level: usize,
    ) -> Result<()> {
        self.write_reference(element, key.id(), key.prototype(), prop_name, level)
    }

    fn write_reference(
        &mut self,
        element: &str,
        id: &str,
        prototype: Option<&str>,
        prop_name: Option<&str>,
        level: usize,
    ) -> Result<()> {
        let prefix = INDENT.repeat(level);
        write!(self.out, "{prefix}<{element} idref=\"{}\"", escape(id))?;
        if let Some(prop_name) = prop_name {
            write!(self.out, " propertyname=\"{}\"", escape(prop_name))?;
        }
        writeln!(
            self.out,
            " prototyperef=\"{}\"/>",
            escape(prototype_attr(prototype))
        )?;
        Ok(())
    }
}

fn prototype_attr(prototype: Option<&str>) -> &str {
    match prototype {
        Some(p) if !p.is_empty() => p,
        _ => FALLBACK_PROTOTYPE,
    }
}

/// True if `name` can be used as an element name as-is.
///
/// Deliberately conservative: letters first, then letters, digits, `-`
/// and `_` only.
pub fn is_valid_element_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

/// Writes `node` as a complete document into a string.
pub fn write_to_string(node: &NodeRef, options: WriterOptions) -> Result<String> {
    let mut writer = XmlWriter::new(Vec::new(), options);
    writer.write(node)?;
    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}
