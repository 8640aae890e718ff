//! Slide snapshots
//!
//! A pure function from (document, slide) to the SVG handed to the
//! renderer. The loaded document is never mutated, so slides cannot
//! observe each other and may be produced in parallel.
//!
//! Layers not on the slide are dropped, unless a visible layer holds a
//! `<use>` clone: then they stay in the document as `display:none` so the
//! clone still has something to point at.

use std::collections::HashMap;

use crate::directives::DirectiveSet;
use crate::document::{format_style, parse_style, Document, Element, NodeId, Rewrite, Rewriter};
use crate::layers::{LayerId, LayerTree};
use crate::resolver::SlideSpec;

/// Text that is swapped for a number in each snapshot. Empty disables.
#[derive(Debug, Clone, Copy)]
pub struct Placeholders<'a> {
    /// Replaced by the 1-based slide number.
    pub number: &'a str,
    /// Replaced by the 0-based page index.
    pub frame: &'a str,
}

pub struct SnapshotBuilder<'a> {
    doc: &'a Document,
    tree: &'a LayerTree,
    directives: &'a DirectiveSet,
    placeholders: Placeholders<'a>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(
        doc: &'a Document,
        tree: &'a LayerTree,
        directives: &'a DirectiveSet,
        placeholders: Placeholders<'a>,
    ) -> Self {
        Self {
            doc,
            tree,
            directives,
            placeholders,
        }
    }

    pub fn build(&self, slide: &SlideSpec) -> String {
        // Explicit layers carry their opacity; ancestors only need to be shown.
        let mut shown: HashMap<NodeId, Option<f64>> = HashMap::new();
        for layer in &slide.layers {
            for ancestor in self.tree.ancestors(layer.id) {
                shown.entry(self.tree.get(ancestor).node).or_insert(None);
            }
        }
        for layer in &slide.layers {
            shown.insert(self.tree.get(layer.id).node, Some(layer.opacity));
        }

        let rewriter = SlideRewriter {
            tree: self.tree,
            directives: self.directives,
            keep_hidden: self.has_clones(slide),
            shown,
            placeholders: self.placeholders,
            number: slide.number.to_string(),
            frame: slide.index.to_string(),
        };
        self.doc.to_xml_with(&rewriter)
    }

    fn has_clones(&self, slide: &SlideSpec) -> bool {
        slide.layers.iter().any(|layer| {
            self.doc
                .preorder(self.tree.get(layer.id).node)
                .into_iter()
                .any(|node| self.doc.element(node).map_or(false, |e| e.local_name() == "use"))
        })
    }
}

struct SlideRewriter<'a> {
    tree: &'a LayerTree,
    directives: &'a DirectiveSet,
    keep_hidden: bool,
    shown: HashMap<NodeId, Option<f64>>,
    placeholders: Placeholders<'a>,
    number: String,
    frame: String,
}

impl Rewriter for SlideRewriter<'_> {
    fn element(&self, id: NodeId, element: &Element) -> Rewrite {
        if element.local_name() == "namedview" || self.directives.is_directive_text(id) {
            return Rewrite::Drop;
        }

        match self.tree.layer_for_node(id) {
            Some(layer) if layer != LayerId::ROOT => match self.shown.get(&id) {
                None if self.keep_hidden => Rewrite::Replace(hidden(element)),
                None => Rewrite::Drop,
                Some(opacity) => Rewrite::Replace(with_visibility(element, *opacity)),
            },
            _ => Rewrite::Keep,
        }
    }

    fn text(&self, _id: NodeId, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed == self.placeholders.number {
            Some(raw.replace(trimmed, &self.number))
        } else if trimmed == self.placeholders.frame {
            Some(raw.replace(trimmed, &self.frame))
        } else {
            None
        }
    }
}

fn hidden(element: &Element) -> Element {
    let mut styles = element.attr("style").map(parse_style).unwrap_or_default();
    set_style(&mut styles, "display", "none".to_string());

    let mut element = element.clone();
    element.set_attr("style", format_style(&styles));
    element
}

fn with_visibility(element: &Element, opacity: Option<f64>) -> Element {
    let mut styles = element.attr("style").map(parse_style).unwrap_or_default();
    set_style(&mut styles, "display", "inline".to_string());
    if let Some(opacity) = opacity {
        set_style(&mut styles, "opacity", opacity.to_string());
    }

    let mut element = element.clone();
    element.set_attr("style", format_style(&styles));
    element
}

fn set_style(styles: &mut Vec<(String, String)>, key: &str, value: String) {
    match styles.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value,
        None => styles.push((key.to_string(), value)),
    }
}
