//! XML record format of the embedded database.
//!
//! ```text
//! <?xml version="1.0"?>
//! <?xml-stylesheet type="text/xsl" href="helma.xsl"?>
//! <xmlroot xmlns:hop="http://www.helma.org/docs/guide/features/database">
//!   <hopobject id="12" name="story" prototype="Story" created="…" lastModified="…">
//!     <hop:parent idref="0" prototyperef="Root"/>
//!     <title>Hello</title>
//!     <count type="integer">3</count>
//!     <hop:child idref="13" prototyperef="Comment"/>
//!   </hopobject>
//! </xmlroot>
//! ```
//!
//! [`XmlWriter`] produces documents, [`RecordReader`] turns a stored record
//! back into a persistent node and [`TreeReader`] rebuilds a whole document
//! as a transient graph.

pub mod date;
pub mod reader;
pub mod tree;
pub mod writer;

use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};

pub use date::{format_date, parse_date};
pub use reader::RecordReader;
pub use tree::TreeReader;
pub use writer::{write_to_string, WriterOptions, XmlWriter};

/// Namespace bound to the `hop` prefix.
pub const NAMESPACE: &str = "http://www.helma.org/docs/guide/features/database";

/// Stylesheet referenced from every document.
pub const STYLESHEET: &str = "helma.xsl";

pub(crate) const HOP_CHILD: &str = "hop:child";
pub(crate) const HOP_PARENT: &str = "hop:parent";

/// Minimal element tree built from a parsed document.
#[derive(Debug, Default)]
pub(crate) struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attrs.push((key, value));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attrs,
            children: Vec::new(),
            text: String::new(),
        })
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parses `xml` into an element tree, reporting failures against `source`.
pub(crate) fn parse_document(xml: &str, source: &Path) -> Result<Element> {
    parse_elements(xml).map_err(|err| match err {
        Error::Malformed { .. } => err,
        other => Error::malformed(source, other),
    })
}

fn parse_elements(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(Element::from_start(&start)?),
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Error::InvalidArgument("unbalanced end tag".into()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
        }
    }
    if !stack.is_empty() {
        return Err(Error::InvalidArgument("unexpected end of document".into()));
    }
    root.ok_or_else(|| Error::InvalidArgument("document has no root element".into()))
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(Error::InvalidArgument("more than one root element".into())),
    }
    Ok(())
}

/// The `hopobject` element of a document, whether wrapped in `xmlroot` or not.
pub(crate) fn record_element<'a>(root: &'a Element, source: &Path) -> Result<&'a Element> {
    if root.name == "hopobject" {
        return Ok(root);
    }
    root.children
        .iter()
        .find(|e| e.name == "hopobject")
        .ok_or_else(|| Error::malformed(source, "no hopobject element"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_element_tree() {
        let xml = "<?xml version=\"1.0\"?><a x=\"1 &amp; 2\"><b>t&lt;</b><c/><![CDATA[raw]]></a>";
        let root = parse_document(xml, Path::new("mem")).unwrap();
        assert_eq!(root.name, "a");
        assert_eq!(root.attr("x"), Some("1 & 2"));
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].text, "t<");
        assert_eq!(root.text, "raw");
    }

    #[test]
    fn truncated_documents_are_malformed() {
        let err = parse_document("<a><b>", Path::new("/db/3.xml")).unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
        assert!(err.to_string().contains("/db/3.xml"));
    }
}
