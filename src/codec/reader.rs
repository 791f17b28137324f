//! Reads single stored records back into persistent nodes.

use std::fs;
use std::path::Path;
use std::sync::Weak;

use tracing::{error, warn};

use super::date::parse_date;
use super::{parse_document, record_element, Element, HOP_CHILD, HOP_PARENT};
use crate::error::{Error, Result};
use crate::manager::NodeManager;
use crate::model::{
    now_millis, DbKey, MappingRegistry, NodeHandle, NodeParts, NodeRef, NodeState, ParentLink,
    Property, PropertyType, Value, Node,
};

/// What a child element of a record turned out to be.
pub(crate) enum Entry<'a> {
    Parent(DbKey),
    Child(NodeHandle, String),
    Property(Property),
    /// An inlined node; only tree reads expand these.
    Inline {
        element: &'a Element,
        prop_name: Option<String>,
    },
}

/// Builds a key for a reference, using the mapping of `prototype` if known.
pub(crate) fn reference_key(
    registry: Option<&MappingRegistry>,
    id: &str,
    prototype: Option<&str>,
) -> DbKey {
    let prototype = prototype.filter(|p| !p.is_empty() && *p != "hopobject");
    match prototype.and_then(|p| registry.and_then(|r| r.get(p))) {
        Some(mapping) => DbKey::for_mapping(Some(&mapping), id),
        None => DbKey::embedded(id).with_prototype(prototype),
    }
}

/// Decodes the text of a literal element according to its `type` attribute.
pub(crate) fn literal_value(type_attr: Option<&str>, text: &str, source: &Path) -> Result<Value> {
    let value = match PropertyType::from_type_attr(type_attr) {
        PropertyType::Boolean => Value::Boolean(text.trim() == "true"),
        PropertyType::Integer => Value::Integer(
            text.trim()
                .parse()
                .map_err(|e| Error::malformed(source, format!("bad integer {text:?}: {e}")))?,
        ),
        PropertyType::Float => Value::Float(
            text.trim()
                .parse()
                .map_err(|e| Error::malformed(source, format!("bad float {text:?}: {e}")))?,
        ),
        PropertyType::Date => match parse_date(text) {
            Some(date) => Value::Date(date),
            None => Value::String(text.to_string()),
        },
        _ => Value::String(text.to_string()),
    };
    Ok(value)
}

/// Identity attributes of a node element.
pub(crate) fn node_parts(element: &Element, state: NodeState, source: &Path) -> Result<NodeParts> {
    let id = element
        .attr("id")
        .ok_or_else(|| Error::malformed(source, format!("<{}> without id", element.name)))?;
    let mut parts = NodeParts::new(id, state);
    parts.name = element.attr("name").map(str::to_string);
    // The writer's fallback prototype stands for "none declared".
    parts.prototype = match element.attr("prototype") {
        None | Some("") | Some("hopobject") => None,
        Some(p) => Some(p.to_string()),
    };
    let created = element.attr("created").and_then(|v| v.parse::<i64>().ok());
    let modified = element.attr("lastModified").and_then(|v| v.parse::<i64>().ok());
    match (created, modified) {
        (Some(created), Some(modified)) => {
            parts.created = created;
            parts.last_modified = modified;
        }
        _ => {
            warn!(source = %source.display(), id, "record has unreadable timestamps");
            let now = now_millis();
            parts.created = now;
            parts.last_modified = now;
        }
    }
    parts.anonymous = element.attr("anonymous") == Some("true");
    Ok(parts)
}

/// Classifies the child elements of a node element.
pub(crate) fn entries<'a>(
    element: &'a Element,
    registry: Option<&MappingRegistry>,
    source: &Path,
) -> Result<Vec<Entry<'a>>> {
    let mut out = Vec::with_capacity(element.children.len());
    for child in &element.children {
        let prop_name = child
            .attr("propertyname")
            .map(str::to_string)
            .unwrap_or_else(|| child.name.clone());
        if let Some(idref) = child.attr("idref") {
            let key = reference_key(registry, idref, child.attr("prototyperef"));
            out.push(match child.name.as_str() {
                HOP_CHILD => Entry::Child(NodeHandle::Key(key), idref.to_string()),
                HOP_PARENT => Entry::Parent(key),
                _ => Entry::Property(Property::new(prop_name, Value::Node(NodeHandle::Key(key)))),
            });
        } else if child.attr("id").is_some() {
            out.push(Entry::Inline {
                element: child,
                prop_name: (child.name != HOP_CHILD).then_some(prop_name),
            });
        } else {
            let value = literal_value(child.attr("type"), &child.text, source)?;
            out.push(Entry::Property(Property::new(prop_name, value)));
        }
    }
    Ok(out)
}

/// Reads stored records as clean persistent nodes.
///
/// Children and node-valued properties become key handles that the node
/// manager resolves on access.
pub struct RecordReader<'a> {
    registry: Option<&'a MappingRegistry>,
    manager: Weak<NodeManager>,
}

impl<'a> RecordReader<'a> {
    pub fn new(registry: Option<&'a MappingRegistry>, manager: Weak<NodeManager>) -> Self {
        Self { registry, manager }
    }

    pub fn read_file(&self, path: &Path) -> Result<NodeRef> {
        let xml = fs::read_to_string(path)?;
        self.read_str(&xml, path).inspect_err(|err| {
            error!(path = %path.display(), error = %err, "error reading node record");
        })
    }

    pub fn read_str(&self, xml: &str, source: &Path) -> Result<NodeRef> {
        let root = parse_document(xml, source)?;
        let record = record_element(&root, source)?;
        let mut parts = node_parts(record, NodeState::Clean, source)?;
        for entry in entries(record, self.registry, source)? {
            match entry {
                Entry::Parent(key) => parts.parent = Some(ParentLink::Key(key)),
                Entry::Child(handle, name) => parts.children.push((handle, name)),
                Entry::Property(prop) => parts.props.push(prop),
                Entry::Inline { element, prop_name } => {
                    let id = element.attr("id").unwrap_or_default();
                    let key = reference_key(self.registry, id, element.attr("prototype"));
                    let handle = NodeHandle::Key(key);
                    match prop_name {
                        Some(name) => parts.props.push(Property::new(name, Value::Node(handle))),
                        None => parts.children.push((handle, id.to_string())),
                    }
                }
            }
        }
        parts.mapping = parts
            .prototype
            .as_deref()
            .and_then(|p| self.registry.and_then(|r| r.get(p)));
        parts.manager = self.manager.clone();
        Ok(Node::from_parts(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::writer::{write_to_string, WriterOptions};
    use time::macros::datetime;

    const RECORD: &str = r#"<?xml version="1.0"?>
<?xml-stylesheet type="text/xsl" href="helma.xsl"?>
<xmlroot xmlns:hop="http://www.helma.org/docs/guide/features/database">
  <hopobject id="12" name="story" prototype="Story" created="1000" lastModified="2000">
    <hop:parent idref="0" prototyperef="Root"/>
    <title> spaced &amp; escaped </title>
    <count type="integer">42</count>
    <ratio type="float">0.5</ratio>
    <flag type="boolean">true</flag>
    <when type="date">05.03.2024 06:07:08.009 UTC</when>
    <legacy type="date">not a date</legacy>
    <property propertyname="odd name">x</property>
    <author idref="7" prototyperef="User"/>
    <hop:child idref="13" prototyperef="Comment"/>
    <hop:child idref="14" prototyperef="hopobject"/>
  </hopobject>
</xmlroot>
"#;

    #[test]
    fn reads_stored_record() {
        let node = RecordReader::new(None, Weak::new())
            .read_str(RECORD, Path::new("12.xml"))
            .unwrap();
        assert_eq!(node.id(), "12");
        assert_eq!(node.name(), "story");
        assert_eq!(node.prototype(), "Story");
        assert_eq!(node.state(), NodeState::Clean);
        assert_eq!(node.created(), 1000);
        assert_eq!(node.last_modified(), 2000);
        assert_eq!(node.get_string("title").as_deref(), Some(" spaced & escaped "));
        assert_eq!(node.get_integer("count"), 42);
        assert_eq!(node.get_float("ratio"), 0.5);
        assert!(node.get_boolean("flag"));
        assert_eq!(node.get_date("when"), Some(datetime!(2024-03-05 06:07:08.009 UTC)));
        assert_eq!(node.get_string("legacy").as_deref(), Some("not a date"));
        assert_eq!(node.get_string("odd name").as_deref(), Some("x"));
        assert_eq!(node.parent_ref(), Some(("0".to_string(), Some("Root".to_string()))));
        assert_eq!(node.number_of_nodes(), 2);
        let handles = node.subnode_handles();
        assert_eq!(handles[0].key(), Some(DbKey::embedded("13")));
        assert_eq!(handles[1].key().and_then(|k| k.prototype().map(str::to_string)), None);
        match node.get("author") {
            Some(Value::Node(NodeHandle::Key(key))) => assert_eq!(key.id(), "7"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_numbers_are_malformed() {
        let xml = RECORD.replace(">42<", ">forty-two<");
        let err = RecordReader::new(None, Weak::new())
            .read_str(&xml, Path::new("/db/12.xml"))
            .unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[test]
    fn missing_id_is_malformed() {
        let xml = RECORD.replace("id=\"12\" ", "");
        assert!(RecordReader::new(None, Weak::new())
            .read_str(&xml, Path::new("x"))
            .is_err());
    }

    #[test]
    fn database_write_reads_back() {
        let mut parts = NodeParts::new("5", NodeState::Clean);
        parts.name = Some("five".into());
        parts.prototype = Some("Page".into());
        parts.created = 1_700_000_000_123;
        parts.last_modified = 1_700_000_000_456;
        parts.props.push(Property::new("body", Value::from("text\nwith lines")));
        parts.props.push(Property::new("n", Value::Integer(-3)));
        parts.children.push((NodeHandle::Key(DbKey::embedded("6")), "6".into()));
        parts.parent = Some(ParentLink::Key(DbKey::embedded("0").with_prototype(Some("Root"))));
        let node = Node::from_parts(parts);

        let xml = write_to_string(&node, WriterOptions::database(None)).unwrap();
        let back = RecordReader::new(None, Weak::new())
            .read_str(&xml, Path::new("5.xml"))
            .unwrap();
        assert_eq!(back.id(), "5");
        assert_eq!(back.name(), "five");
        assert_eq!(back.prototype(), "Page");
        assert_eq!(back.created(), 1_700_000_000_123);
        assert_eq!(back.last_modified(), 1_700_000_000_456);
        assert_eq!(back.get_string("body").as_deref(), Some("text\nwith lines"));
        assert_eq!(back.get_integer("n"), -3);
        assert_eq!(back.subnode_handles()[0].id(), "6");
        assert_eq!(back.parent_ref().map(|(id, _)| id).as_deref(), Some("0"));
    }
}
