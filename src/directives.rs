//! Directive Parser
//!
//! Text elements whose first line is `#import#`, `#master#` or `#content#`
//! are directives. Parsing is pure: the same document always yields the
//! same [`DirectiveSet`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document::{Document, NodeId};
use crate::layers::{LayerId, LayerTree};
use crate::pipeline::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveKind {
    Import,
    Master,
    Content,
}

impl DirectiveKind {
    pub fn marker(self) -> &'static str {
        match self {
            DirectiveKind::Import => "#import#",
            DirectiveKind::Master => "#master#",
            DirectiveKind::Content => "#content#",
        }
    }

    fn from_marker(line: &str) -> Option<Self> {
        [Self::Import, Self::Master, Self::Content]
            .into_iter()
            .find(|k| k.marker() == line)
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sign {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub layer_name: String,
    pub sign: Sign,
    /// Opacity multiplier from a `*<factor>` suffix.
    pub factor: f64,
}

impl Entry {
    /// `Name`, `Name*0.5` or `-Name`. A `*` suffix that is not a
    /// non-negative number is part of the name.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (sign, rest) = match text.strip_prefix('-') {
            Some(rest) => (Sign::Remove, rest.trim()),
            None => (Sign::Add, text),
        };

        let (name, factor) = match rest.rsplit_once('*') {
            Some((name, factor)) => match factor.trim().parse::<f64>() {
                Ok(f) if f.is_finite() && f >= 0.0 => (name.trim(), f),
                _ => (rest, 1.0),
            },
            None => (rest, 1.0),
        };

        if name.is_empty() {
            return None;
        }
        Some(Self {
            layer_name: name.to_string(),
            sign,
            factor,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveScope {
    Global,
    Layer(LayerId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub kind: DirectiveKind,
    pub scope: DirectiveScope,
    pub entries: Vec<Entry>,
    pub source: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentLine {
    /// `+` prefix: start from the previous line's entries.
    pub extend_previous: bool,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentDirective {
    pub scope: LayerId,
    pub lines: Vec<ContentLine>,
    pub source: NodeId,
}

/// A `<text>` element and the layer it sits in.
#[derive(Debug, Clone)]
pub struct TextElement {
    pub node: NodeId,
    pub layer: LayerId,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DirectiveSet {
    pub master: Option<Directive>,
    pub imports: BTreeMap<LayerId, Directive>,
    pub contents: BTreeMap<LayerId, ContentDirective>,
    /// Every directive text element, including ignored duplicates.
    sources: Vec<NodeId>,
}

impl DirectiveSet {
    pub fn import_for(&self, layer: LayerId) -> Option<&Directive> {
        self.imports.get(&layer)
    }

    pub fn content_for(&self, layer: LayerId) -> Option<&ContentDirective> {
        self.contents.get(&layer)
    }

    pub fn is_directive_text(&self, node: NodeId) -> bool {
        self.sources.contains(&node)
    }

    pub fn sources(&self) -> &[NodeId] {
        &self.sources
    }
}

pub fn collect_text_elements(doc: &Document, tree: &LayerTree) -> Vec<TextElement> {
    doc.preorder(doc.root())
        .into_iter()
        .filter(|id| doc.element(*id).map_or(false, |e| e.is_text()))
        .map(|node| TextElement {
            node,
            layer: tree.containing_layer(doc, node),
            lines: doc.text_lines(node),
        })
        .collect()
}

/// First block wins everywhere: the first `#master#` in document order,
/// the first `#import#`/`#content#` per layer. Later ones are ignored.
pub fn parse_directives(
    texts: &[TextElement],
    tree: &LayerTree,
) -> Result<DirectiveSet, PipelineError> {
    let mut set = DirectiveSet::default();

    for text in texts {
        let Some(kind) = text
            .lines
            .first()
            .and_then(|l| DirectiveKind::from_marker(l.trim()))
        else {
            continue;
        };
        let body = &text.lines[1..];
        set.sources.push(text.node);

        match kind {
            DirectiveKind::Master => {
                if set.master.is_some() {
                    log::warn!("Ignoring additional {} block in {}", kind, tree.path_name(text.layer));
                    continue;
                }
                set.master = Some(Directive {
                    kind,
                    scope: DirectiveScope::Global,
                    entries: parse_entries(body),
                    source: text.node,
                });
            }
            DirectiveKind::Import => {
                if text.layer == LayerId::ROOT {
                    return Err(invalid_scope(kind, tree, text.layer));
                }
                if set.imports.contains_key(&text.layer) {
                    log::warn!("Ignoring additional {} block in {}", kind, tree.path_name(text.layer));
                    continue;
                }
                set.imports.insert(
                    text.layer,
                    Directive {
                        kind,
                        scope: DirectiveScope::Layer(text.layer),
                        entries: parse_entries(body),
                        source: text.node,
                    },
                );
            }
            DirectiveKind::Content => {
                // Sections and their direct children only.
                let depth = tree.depth(text.layer);
                if depth == 0 || depth > 2 {
                    return Err(invalid_scope(kind, tree, text.layer));
                }
                if set.contents.contains_key(&text.layer) {
                    log::warn!("Ignoring additional {} block in {}", kind, tree.path_name(text.layer));
                    continue;
                }
                set.contents.insert(
                    text.layer,
                    ContentDirective {
                        scope: text.layer,
                        lines: parse_content_lines(body),
                        source: text.node,
                    },
                );
            }
        }
    }

    Ok(set)
}

fn parse_entries(lines: &[String]) -> Vec<Entry> {
    lines.iter().filter_map(|l| Entry::parse(l)).collect()
}

fn parse_content_lines(lines: &[String]) -> Vec<ContentLine> {
    lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|line| {
            let (extend_previous, rest) = match line.strip_prefix('+') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            ContentLine {
                extend_previous,
                entries: rest.split(',').filter_map(Entry::parse).collect(),
            }
        })
        .collect()
}

fn invalid_scope(kind: DirectiveKind, tree: &LayerTree, layer: LayerId) -> PipelineError {
    PipelineError::InvalidDirectiveScope {
        kind,
        location: tree.path_name(layer),
    }
}
