//! Document Model - SVG as an arena of nodes
//!
//! Parsing keeps every piece of markup in its raw (escaped) form so a
//! snapshot written back out differs from the source only where a
//! [`Rewriter`] asked for it.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

pub const GROUPMODE_ATTR: &str = "inkscape:groupmode";
pub const LABEL_ATTR: &str = "inkscape:label";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed document at byte {position}: {message}")]
    Malformed { position: u64, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    /// Escaped, exactly as found in the source.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub self_closing: bool,
}

impl Element {
    pub fn local_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    /// Raw attribute value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn attr_unescaped(&self, name: &str) -> Option<String> {
        self.attr(name).map(|raw| unescape_lossy(raw).into_owned())
    }

    /// Sets an attribute from an already escaped value, replacing in place.
    pub fn set_attr(&mut self, name: &str, value: String) {
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(attr) => attr.value = value,
            None => self.attributes.push(Attribute {
                name: name.to_string(),
                value,
            }),
        }
    }

    pub fn is_layer(&self) -> bool {
        self.local_name() == "g" && self.attr(GROUPMODE_ATTR) == Some("layer")
    }

    pub fn is_text(&self) -> bool {
        self.local_name() == "text"
    }

    /// Layer label, falling back to the element id.
    pub fn label(&self) -> Option<String> {
        self.attr_unescaped(LABEL_ATTR)
            .or_else(|| self.attr_unescaped("id"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
    Declaration(String),
    Instruction(String),
    DocType(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl Node {
    pub fn element(&self) -> Option<&Element> {
        match &self.kind {
            NodeKind::Element(e) => Some(e),
            _ => None,
        }
    }
}

/// What a [`Rewriter`] wants done with an element during serialization.
#[derive(Debug, Clone)]
pub enum Rewrite {
    Keep,
    Drop,
    Replace(Element),
}

pub trait Rewriter {
    fn element(&self, _id: NodeId, _element: &Element) -> Rewrite {
        Rewrite::Keep
    }

    /// Return replacement raw text for a text node.
    fn text(&self, _id: NodeId, _raw: &str) -> Option<String> {
        None
    }
}

struct Verbatim;

impl Rewriter for Verbatim {}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    top_level: Vec<NodeId>,
    root: NodeId,
}

impl Document {
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let source = fs::read_to_string(path).map_err(|source| DocumentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&source)
    }

    pub fn parse(source: &str) -> Result<Self, DocumentError> {
        let mut reader = Reader::from_str(source);
        let mut nodes: Vec<Node> = Vec::new();
        let mut top_level = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();

        loop {
            let event = reader.read_event().map_err(|e| DocumentError::Malformed {
                position: reader.buffer_position() as u64,
                message: e.to_string(),
            })?;

            let kind = match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let mut attributes = Vec::new();
                    for attr in e.attributes() {
                        let attr = attr.map_err(|e| DocumentError::Malformed {
                            position: reader.buffer_position() as u64,
                            message: e.to_string(),
                        })?;
                        attributes.push(Attribute {
                            name: lossy(attr.key.as_ref()),
                            value: lossy(&attr.value),
                        });
                    }
                    NodeKind::Element(Element {
                        name: lossy(e.name().as_ref()),
                        attributes,
                        self_closing: matches!(event, Event::Empty(_)),
                    })
                }
                Event::End(_) => {
                    stack.pop();
                    continue;
                }
                Event::Text(ref e) => NodeKind::Text(lossy(e)),
                Event::GeneralRef(ref e) => NodeKind::Text(format!("&{};", lossy(e))),
                Event::CData(ref e) => NodeKind::CData(lossy(e)),
                Event::Comment(ref e) => NodeKind::Comment(lossy(e)),
                Event::Decl(ref e) => NodeKind::Declaration(lossy(e)),
                Event::PI(ref e) => NodeKind::Instruction(lossy(e)),
                Event::DocType(ref e) => NodeKind::DocType(lossy(e)),
                Event::Eof => break,
            };

            let opens = matches!(&kind, NodeKind::Element(e) if !e.self_closing);
            let id = NodeId(nodes.len());
            let parent = stack.last().copied();
            nodes.push(Node {
                kind,
                parent,
                children: Vec::new(),
            });
            match parent {
                Some(p) => nodes[p.0].children.push(id),
                None => top_level.push(id),
            }
            if opens {
                stack.push(id);
            }
        }

        if !stack.is_empty() {
            return Err(DocumentError::Malformed {
                position: reader.buffer_position() as u64,
                message: format!("{} unclosed element(s) at end of input", stack.len()),
            });
        }

        let root = top_level
            .iter()
            .copied()
            .find(|id| nodes[id.0].element().is_some())
            .ok_or_else(|| DocumentError::Malformed {
                position: 0,
                message: "no root element".to_string(),
            })?;

        Ok(Self {
            nodes,
            top_level,
            root,
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        self.nodes[id.0].element()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes below `id` (inclusive) in document order.
    pub fn preorder(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next.0].children.iter().rev().copied());
        }
        out
    }

    /// Unescaped concatenation of every text and CDATA node below `id`.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut raw = String::new();
        for node in self.preorder(id) {
            match &self.nodes[node.0].kind {
                NodeKind::Text(t) => raw.push_str(t),
                // Escaped so the single unescape pass below leaves it intact.
                NodeKind::CData(c) => raw.push_str(&quick_xml::escape::escape(c.as_str())),
                _ => {}
            }
        }
        unescape_lossy(&raw).into_owned()
    }

    /// Lines of a `<text>` element: one per child `<tspan>`, or the
    /// element's own text split on newlines when it has none.
    pub fn text_lines(&self, id: NodeId) -> Vec<String> {
        let spans: Vec<NodeId> = self.nodes[id.0]
            .children
            .iter()
            .copied()
            .filter(|c| {
                self.element(*c)
                    .map_or(false, |e| e.local_name() == "tspan")
            })
            .collect();

        if spans.is_empty() {
            self.text_content(id)
                .lines()
                .map(|l| l.trim().to_string())
                .collect()
        } else {
            spans
                .into_iter()
                .map(|s| self.text_content(s).trim().to_string())
                .collect()
        }
    }

    pub fn to_xml(&self) -> String {
        self.to_xml_with(&Verbatim)
    }

    pub fn to_xml_with(&self, rewriter: &impl Rewriter) -> String {
        let mut out = String::new();
        for id in &self.top_level {
            self.write_node(*id, rewriter, &mut out);
        }
        out
    }

    fn write_node(&self, id: NodeId, rewriter: &impl Rewriter, out: &mut String) {
        let node = &self.nodes[id.0];
        match &node.kind {
            NodeKind::Element(element) => {
                let replaced;
                let element = match rewriter.element(id, element) {
                    Rewrite::Keep => element,
                    Rewrite::Drop => return,
                    Rewrite::Replace(e) => {
                        replaced = e;
                        &replaced
                    }
                };
                out.push('<');
                out.push_str(&element.name);
                for attr in &element.attributes {
                    let quote = if attr.value.contains('"') { '\'' } else { '"' };
                    out.push(' ');
                    out.push_str(&attr.name);
                    out.push('=');
                    out.push(quote);
                    out.push_str(&attr.value);
                    out.push(quote);
                }
                if element.self_closing && node.children.is_empty() {
                    out.push_str("/>");
                    return;
                }
                out.push('>');
                for child in &node.children {
                    self.write_node(*child, rewriter, out);
                }
                out.push_str("</");
                out.push_str(&element.name);
                out.push('>');
            }
            NodeKind::Text(raw) => match rewriter.text(id, raw) {
                Some(text) => out.push_str(&text),
                None => out.push_str(raw),
            },
            NodeKind::CData(c) => {
                out.push_str("<![CDATA[");
                out.push_str(c);
                out.push_str("]]>");
            }
            NodeKind::Comment(c) => {
                out.push_str("<!--");
                out.push_str(c);
                out.push_str("-->");
            }
            NodeKind::Declaration(d) => {
                out.push_str("<?");
                out.push_str(d);
                out.push_str("?>");
            }
            NodeKind::Instruction(p) => {
                out.push_str("<?");
                out.push_str(p);
                out.push_str("?>");
            }
            NodeKind::DocType(d) => {
                out.push_str("<!DOCTYPE ");
                out.push_str(d);
                out.push('>');
            }
        }
    }
}

/// Parse a `style="a:b;c:d"` attribute into ordered pairs.
pub fn parse_style(style: &str) -> Vec<(String, String)> {
    style
        .split(';')
        .filter_map(|item| {
            let (key, value) = item.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn format_style(styles: &[(String, String)]) -> String {
    styles
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join(";")
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn unescape_lossy(raw: &str) -> Cow<'_, str> {
    match quick_xml::escape::unescape(raw) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Keeping undecodable text as-is: {}", e);
            Cow::Borrowed(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!-- made by hand -->
<svg xmlns="http://www.w3.org/2000/svg" xmlns:inkscape="http://www.inkscape.org/namespaces/inkscape" width="100">
  <g inkscape:groupmode="layer" inkscape:label="Fish &amp; Chips" style="display:none">
    <rect x="0" y="0"/>
    <text><tspan>#import#</tspan><tspan> Logo </tspan></text>
  </g>
</svg>"#;

    #[test]
    fn test_verbatim_serialization_matches_source() {
        let doc = Document::parse(SAMPLE).unwrap();
        assert_eq!(doc.to_xml(), SAMPLE);
    }

    #[test]
    fn test_layer_label_unescaped() {
        let doc = Document::parse(SAMPLE).unwrap();
        let layer = doc
            .preorder(doc.root())
            .into_iter()
            .filter_map(|id| doc.element(id))
            .find(|e| e.is_layer())
            .unwrap();
        assert_eq!(layer.label().as_deref(), Some("Fish & Chips"));
    }

    #[test]
    fn test_text_lines_from_tspans() {
        let doc = Document::parse(SAMPLE).unwrap();
        let text = doc
            .preorder(doc.root())
            .into_iter()
            .find(|id| doc.element(*id).map_or(false, |e| e.is_text()))
            .unwrap();
        assert_eq!(doc.text_lines(text), vec!["#import#", "Logo"]);
    }

    #[test]
    fn test_unclosed_element_rejected() {
        let err = Document::parse("<svg><g>").unwrap_err();
        assert!(matches!(err, DocumentError::Malformed { .. }));
    }

    #[test]
    fn test_mismatched_end_rejected() {
        assert!(Document::parse("<svg><g></text></svg>").is_err());
    }

    #[test]
    fn test_style_roundtrip_keeps_order() {
        let styles = parse_style("display:none; opacity:0.5;fill:#fff;");
        assert_eq!(styles.len(), 3);
        assert_eq!(format_style(&styles), "display:none;opacity:0.5;fill:#fff");
    }
}
