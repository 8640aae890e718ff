//! Slide Resolver - layer tree + directives to an ordered Presentation
//!
//! Every directive entry is resolved to a layer before the first slide is
//! built, so a bad name fails the pass before any rendering starts.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::directives::{DirectiveSet, Entry, Sign};
use crate::layers::{LayerId, LayerTree, LookupError, NamePolicy};
use crate::pipeline::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisibleLayer {
    pub id: LayerId,
    pub name: String,
    /// Base opacity times the directive multiplier, clamped to `[0, 1]`.
    pub opacity: f64,
}

/// One output page: exactly the layers that must be visible.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlideSpec {
    /// 0-based page position.
    pub index: usize,
    /// 1-based slide number, shared by every frame of one build.
    pub number: usize,
    pub section: String,
    pub layers: Vec<VisibleLayer>,
}

impl SlideSpec {
    pub fn contains(&self, id: LayerId) -> bool {
        self.layers.iter().any(|l| l.id == id)
    }

    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn opacity_of(&self, name: &str) -> Option<f64> {
        self.layers.iter().find(|l| l.name == name).map(|l| l.opacity)
    }

    /// `A, B*0.50` style summary for diagnostics.
    pub fn describe(&self) -> String {
        self.layers
            .iter()
            .map(|l| {
                if (l.opacity - 1.0).abs() < f64::EPSILON {
                    l.name.clone()
                } else {
                    format!("{}*{:.2}", l.name, l.opacity)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Presentation {
    pub slides: Vec<SlideSpec>,
}

impl Presentation {
    pub fn len(&self) -> usize {
        self.slides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slides.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SlideSpec> {
        self.slides.iter()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub name_policy: NamePolicy,
    pub apply_master: bool,
    /// One slide per top-level layer; sublayers stay hidden.
    pub flat: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            name_policy: NamePolicy::Strict,
            apply_master: true,
            flat: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ResolvedEntry {
    id: LayerId,
    sign: Sign,
    factor: f64,
}

/// Adds minus removes; a removal beats any multiplier on the same layer.
#[derive(Debug, Clone, Default)]
struct NetSet {
    adds: Vec<(LayerId, f64)>,
    removes: Vec<LayerId>,
}

impl NetSet {
    fn from_entries(entries: &[ResolvedEntry]) -> Self {
        let removes: Vec<LayerId> = entries
            .iter()
            .filter(|e| e.sign == Sign::Remove)
            .map(|e| e.id)
            .collect();
        let adds = entries
            .iter()
            .filter(|e| e.sign == Sign::Add && !removes.contains(&e.id))
            .map(|e| (e.id, e.factor))
            .collect();
        Self { adds, removes }
    }
}

struct Resolved {
    master: Vec<(LayerId, f64)>,
    imports: BTreeMap<LayerId, NetSet>,
    contents: BTreeMap<LayerId, Vec<(bool, Vec<ResolvedEntry>)>>,
    resources: HashSet<LayerId>,
}

pub struct SlideResolver<'a> {
    tree: &'a LayerTree,
    directives: &'a DirectiveSet,
    options: ResolveOptions,
}

impl<'a> SlideResolver<'a> {
    pub fn new(tree: &'a LayerTree, directives: &'a DirectiveSet, options: ResolveOptions) -> Self {
        Self {
            tree,
            directives,
            options,
        }
    }

    pub fn resolve(&self) -> Result<Presentation, PipelineError> {
        let resolved = self.resolve_directives()?;
        let mut slides = Vec::new();
        let mut number = 0;

        for &section in self.tree.sections() {
            if resolved.resources.contains(&section) {
                log::debug!("'{}' is a master layer, not a section", self.tree.name(section));
                continue;
            }
            if self.options.flat {
                number += 1;
                let mut slide = SlideBuilder::new(self.tree);
                slide.show_only(section, 1.0);
                slides.push(self.finish(slide, section, &[], &[section], &resolved, number));
            } else {
                self.section_slides(section, &resolved, &mut slides, &mut number);
            }
        }

        for (index, slide) in slides.iter_mut().enumerate() {
            slide.index = index;
        }
        Ok(Presentation { slides })
    }

    fn resolve_directives(&self) -> Result<Resolved, PipelineError> {
        let mut resources = HashSet::new();

        let master = match &self.directives.master {
            Some(directive) => {
                let entries = self.resolve_entries(&directive.entries, "global")?;
                for entry in &entries {
                    if entry.sign == Sign::Add
                        && self.tree.is_section(entry.id)
                        && !self.tree.has_sublayers(entry.id)
                    {
                        resources.insert(entry.id);
                    }
                }
                NetSet::from_entries(&entries).adds
            }
            None => Vec::new(),
        };

        let mut imports = BTreeMap::new();
        for (layer, directive) in &self.directives.imports {
            let entries = self.resolve_entries(&directive.entries, &self.tree.path_name(*layer))?;
            imports.insert(*layer, NetSet::from_entries(&entries));
        }

        let mut contents = BTreeMap::new();
        for (layer, directive) in &self.directives.contents {
            let scope = self.tree.path_name(*layer);
            let mut lines = Vec::with_capacity(directive.lines.len());
            for line in &directive.lines {
                let entries = self.resolve_entries(&line.entries, &scope)?;
                lines.push((line.extend_previous, entries));
            }
            contents.insert(*layer, lines);
        }

        Ok(Resolved {
            master,
            imports,
            contents,
            resources,
        })
    }

    fn resolve_entries(&self, entries: &[Entry], scope: &str) -> Result<Vec<ResolvedEntry>, PipelineError> {
        entries
            .iter()
            .map(|entry| -> Result<ResolvedEntry, PipelineError> {
                let id = self
                    .tree
                    .resolve(&entry.layer_name, self.options.name_policy)
                    .map_err(|e| match e {
                        LookupError::Unknown(name) => PipelineError::UnknownLayerReference {
                            name,
                            scope: scope.to_string(),
                        },
                        LookupError::Ambiguous { name, count } => PipelineError::AmbiguousLayerName {
                            name,
                            count,
                            scope: scope.to_string(),
                        },
                    })?;
                Ok(ResolvedEntry {
                    id,
                    sign: entry.sign,
                    factor: entry.factor,
                })
            })
            .collect()
    }

    fn section_slides(
        &self,
        section: LayerId,
        resolved: &Resolved,
        out: &mut Vec<SlideSpec>,
        number: &mut usize,
    ) {
        let tree = self.tree;

        if let Some(lines) = resolved.contents.get(&section) {
            self.content_slides(section, &[section], lines, resolved, out, number);
            return;
        }

        let children = tree.children(section);
        let framed = children
            .iter()
            .any(|c| tree.has_sublayers(*c) || resolved.contents.contains_key(c));

        if !framed {
            let mut slide = SlideBuilder::new(tree);
            slide.show_only(section, 1.0);
            for &child in children {
                slide.show(child, 1.0);
            }
            let chain: Vec<LayerId> = std::iter::once(section).chain(children.iter().copied()).collect();
            *number += 1;
            out.push(self.finish(slide, section, &[], &chain, resolved, *number));
            return;
        }

        for &child in children {
            if let Some(lines) = resolved.contents.get(&child) {
                self.content_slides(section, &[section, child], lines, resolved, out, number);
                continue;
            }

            *number += 1;
            let frames = tree.children(child);
            if frames.is_empty() {
                let mut slide = SlideBuilder::new(tree);
                slide.show_only(section, 1.0);
                slide.show(child, 1.0);
                out.push(self.finish(slide, section, &[], &[section, child], resolved, *number));
                continue;
            }

            // Cumulative: frame i keeps frames 0..i visible.
            for shown in 1..=frames.len() {
                let mut slide = SlideBuilder::new(tree);
                slide.show_only(section, 1.0);
                slide.show_only(child, 1.0);
                for &frame in &frames[..shown] {
                    slide.show(frame, 1.0);
                }
                let chain: Vec<LayerId> = [section, child]
                    .into_iter()
                    .chain(frames[..shown].iter().copied())
                    .collect();
                out.push(self.finish(slide, section, &[], &chain, resolved, *number));
            }
        }
    }

    fn content_slides(
        &self,
        section: LayerId,
        chain: &[LayerId],
        lines: &[(bool, Vec<ResolvedEntry>)],
        resolved: &Resolved,
        out: &mut Vec<SlideSpec>,
        number: &mut usize,
    ) {
        let mut previous: Vec<ResolvedEntry> = Vec::new();
        for (extend_previous, entries) in lines {
            // A `+` line builds on the previous slide and keeps its number.
            let mut current = if *extend_previous {
                previous.clone()
            } else {
                *number += 1;
                Vec::new()
            };
            current.extend_from_slice(entries);

            let mut slide = SlideBuilder::new(self.tree);
            slide.show_only(section, 1.0);
            out.push(self.finish(slide, section, &current, chain, resolved, *number));
            previous = current;
        }
    }

    /// Structural layers, then master, then content entries, then the
    /// imports along `chain` from outermost to innermost.
    fn finish(
        &self,
        mut slide: SlideBuilder<'_>,
        section: LayerId,
        content: &[ResolvedEntry],
        chain: &[LayerId],
        resolved: &Resolved,
        number: usize,
    ) -> SlideSpec {
        if self.options.apply_master {
            for &(id, factor) in &resolved.master {
                slide.show(id, factor);
            }
        }

        for entry in content {
            match entry.sign {
                Sign::Add => slide.show(entry.id, entry.factor),
                Sign::Remove => slide.hide(entry.id),
            }
        }

        for scope in chain {
            if let Some(import) = resolved.imports.get(scope) {
                for &(id, factor) in &import.adds {
                    slide.show(id, factor);
                }
                for &id in &import.removes {
                    slide.hide(id);
                }
            }
        }

        slide.build(self.tree.name(section), number)
    }
}

struct SlideBuilder<'t> {
    tree: &'t LayerTree,
    layers: Vec<(LayerId, f64)>,
}

impl<'t> SlideBuilder<'t> {
    fn new(tree: &'t LayerTree) -> Self {
        Self {
            tree,
            layers: Vec::new(),
        }
    }

    /// Last writer wins on the layer's own multiplier.
    fn show_only(&mut self, id: LayerId, factor: f64) {
        match self.layers.iter_mut().find(|(l, _)| *l == id) {
            Some(existing) => existing.1 = factor,
            None => self.layers.push((id, factor)),
        }
    }

    /// Shows `id` and its sublayers; sublayers already present keep theirs.
    fn show(&mut self, id: LayerId, factor: f64) {
        self.show_only(id, factor);
        for descendant in self.tree.subtree(id).into_iter().skip(1) {
            if !self.layers.iter().any(|(l, _)| *l == descendant) {
                self.layers.push((descendant, 1.0));
            }
        }
    }

    fn hide(&mut self, id: LayerId) {
        let gone = self.tree.subtree(id);
        self.layers.retain(|(l, _)| !gone.contains(l));
    }

    fn build(self, section: &str, number: usize) -> SlideSpec {
        let tree = self.tree;
        SlideSpec {
            index: 0,
            number,
            section: section.to_string(),
            layers: self
                .layers
                .into_iter()
                .map(|(id, factor)| {
                    let layer = tree.get(id);
                    VisibleLayer {
                        id,
                        name: layer.name.clone(),
                        opacity: (layer.opacity * factor).clamp(0.0, 1.0),
                    }
                })
                .collect(),
        }
    }
}
