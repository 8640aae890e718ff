//! Layer Tree Model
//!
//! Built once per document load and read-only afterwards. Layer ids are
//! assigned in document order, so iterating ids is iterating the document.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{parse_style, Document, Element, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(usize);

impl LayerId {
    /// The synthetic root standing in for the document element.
    pub const ROOT: LayerId = LayerId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub node: NodeId,
    pub parent: Option<LayerId>,
    pub children: Vec<LayerId>,
    pub opacity: f64,
}

/// How a directive entry picks a layer when its name is not unique.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamePolicy {
    /// Ambiguity is an error.
    #[default]
    Strict,
    /// First match in document order.
    First,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no layer named '{0}'")]
    Unknown(String),

    #[error("layer name '{name}' matches {count} layers")]
    Ambiguous { name: String, count: usize },
}

#[derive(Debug, Clone)]
pub struct LayerTree {
    layers: Vec<Layer>,
    by_node: HashMap<NodeId, LayerId>,
}

impl LayerTree {
    pub fn from_document(doc: &Document) -> Self {
        let mut tree = Self {
            layers: vec![Layer {
                id: LayerId::ROOT,
                name: String::new(),
                node: doc.root(),
                parent: None,
                children: Vec::new(),
                opacity: 1.0,
            }],
            by_node: HashMap::new(),
        };
        tree.by_node.insert(doc.root(), LayerId::ROOT);
        tree.collect(doc, doc.root(), LayerId::ROOT);
        tree
    }

    fn collect(&mut self, doc: &Document, node: NodeId, owner: LayerId) {
        for &child in &doc.node(node).children {
            let Some(element) = doc.element(child) else {
                continue;
            };

            if !element.is_layer() {
                self.collect(doc, child, owner);
                continue;
            }

            let id = LayerId(self.layers.len());
            self.layers.push(Layer {
                id,
                name: element.label().unwrap_or_default(),
                node: child,
                parent: Some(owner),
                children: Vec::new(),
                opacity: base_opacity(element),
            });
            self.layers[owner.0].children.push(id);
            self.by_node.insert(child, id);
            self.collect(doc, child, id);
        }
    }

    pub fn get(&self, id: LayerId) -> &Layer {
        &self.layers[id.0]
    }

    pub fn name(&self, id: LayerId) -> &str {
        &self.layers[id.0].name
    }

    /// Every layer except the root, in document order.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter().skip(1)
    }

    pub fn len(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sections(&self) -> &[LayerId] {
        &self.layers[LayerId::ROOT.0].children
    }

    pub fn children(&self, id: LayerId) -> &[LayerId] {
        &self.layers[id.0].children
    }

    pub fn parent(&self, id: LayerId) -> Option<LayerId> {
        self.layers[id.0].parent
    }

    pub fn has_sublayers(&self, id: LayerId) -> bool {
        !self.layers[id.0].children.is_empty()
    }

    pub fn depth(&self, id: LayerId) -> usize {
        let mut depth = 0;
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            depth += 1;
            current = parent;
        }
        depth
    }

    pub fn is_section(&self, id: LayerId) -> bool {
        self.parent(id) == Some(LayerId::ROOT)
    }

    /// Frames sit two levels below their section.
    pub fn is_frame(&self, id: LayerId) -> bool {
        self.depth(id) == 3
    }

    /// Path from the section down to `id`, root excluded.
    pub fn path(&self, id: LayerId) -> Vec<LayerId> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(layer) = current {
            if layer == LayerId::ROOT {
                break;
            }
            path.push(layer);
            current = self.parent(layer);
        }
        path.reverse();
        path
    }

    pub fn path_name(&self, id: LayerId) -> String {
        if id == LayerId::ROOT {
            return "<root>".to_string();
        }
        self.path(id)
            .into_iter()
            .map(|l| self.name(l))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// `id` and all of its descendant layers, in document order.
    pub fn subtree(&self, id: LayerId) -> Vec<LayerId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    pub fn ancestors(&self, id: LayerId) -> impl Iterator<Item = LayerId> + '_ {
        std::iter::successors(self.parent(id), move |l| self.parent(*l))
            .filter(|l| *l != LayerId::ROOT)
    }

    pub fn find_by_name(&self, name: &str) -> Vec<LayerId> {
        self.layers().filter(|l| l.name == name).map(|l| l.id).collect()
    }

    pub fn resolve(&self, name: &str, policy: NamePolicy) -> Result<LayerId, LookupError> {
        let matches = self.find_by_name(name);
        match (matches.as_slice(), policy) {
            ([], _) => Err(LookupError::Unknown(name.to_string())),
            ([only], _) => Ok(*only),
            ([first, ..], NamePolicy::First) => Ok(*first),
            (all, NamePolicy::Strict) => Err(LookupError::Ambiguous {
                name: name.to_string(),
                count: all.len(),
            }),
        }
    }

    pub fn layer_for_node(&self, node: NodeId) -> Option<LayerId> {
        self.by_node.get(&node).copied()
    }

    /// Nearest layer enclosing `node`, or the root.
    pub fn containing_layer(&self, doc: &Document, node: NodeId) -> LayerId {
        let mut current = doc.node(node).parent;
        while let Some(n) = current {
            if let Some(layer) = self.layer_for_node(n) {
                return layer;
            }
            current = doc.node(n).parent;
        }
        LayerId::ROOT
    }
}

fn base_opacity(element: &Element) -> f64 {
    let from_style = element
        .attr("style")
        .and_then(|s| parse_style(s).into_iter().find(|(k, _)| k == "opacity"))
        .map(|(_, v)| v);
    let raw = from_style.or_else(|| element.attr("opacity").map(str::to_string));

    match raw {
        None => 1.0,
        Some(value) => match value.parse::<f64>() {
            Ok(o) if o.is_finite() => o.clamp(0.0, 1.0),
            _ => {
                log::warn!(
                    "Layer '{}' has unreadable opacity '{}', using 1.0",
                    element.label().unwrap_or_default(),
                    value
                );
                1.0
            }
        },
    }
}
