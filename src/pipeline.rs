//! Compilation Pipeline - Single Entry Point
//!
//! parse -> resolve -> snapshot -> render -> assemble. Everything up to
//! resolution runs before the run lock is taken or any renderer starts, so
//! a broken document never costs render time.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assemble::{detect_assembler, Assembler, PageAssembler};
use crate::cache::{CacheDir, CacheManifest, RunLock};
use crate::config::{default_output_for, RunConfig};
use crate::directives::{collect_text_elements, parse_directives, DirectiveKind, DirectiveSet};
use crate::document::{Document, DocumentError};
use crate::hashing::digest;
use crate::layers::LayerTree;
use crate::render::{prepare_slides, CancelToken, InkscapeRenderer, RenderDriver, Renderer};
use crate::resolver::{Presentation, ResolveOptions, SlideResolver};
use crate::snapshot::{Placeholders, SnapshotBuilder};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Cannot parse document: {0}")]
    DocumentParse(#[from] DocumentError),

    #[error("{kind} directive is not allowed in {location}")]
    InvalidDirectiveScope { kind: DirectiveKind, location: String },

    #[error("Unknown layer '{name}' referenced in {scope}")]
    UnknownLayerReference { name: String, scope: String },

    #[error("Layer name '{name}' referenced in {scope} matches {count} layers")]
    AmbiguousLayerName {
        name: String,
        count: usize,
        scope: String,
    },

    #[error("Rendering slide {index} of section '{section}' [{layers}] failed: {message}")]
    RenderFailure {
        index: usize,
        section: String,
        layers: String,
        message: String,
    },

    #[error("Assembly failed: {0}")]
    AssemblyFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Another run holds {0}")]
    CacheLocked(PathBuf),

    #[error("Document has no sections, nothing to present")]
    EmptyPresentation,

    #[error("Pass cancelled")]
    Cancelled,

    #[error("Cannot start render workers: {0}")]
    WorkerPool(String),

    #[error("No PDF merger found on PATH (install pdfunite or ghostscript)")]
    NoAssembler,

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileRequest {
    pub input: PathBuf,
    /// Defaults to the input with a `.pdf` extension.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Bypass and wipe the persistent page cache.
    #[serde(default)]
    pub temp: bool,
}

impl CompileRequest {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: None,
            temp: false,
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| default_output_for(&self.input))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledPresentation {
    pub output: PathBuf,
    pub slides: usize,
    /// Renderer invocations this pass.
    pub rendered: usize,
    /// Slides served from the page cache.
    pub reused: usize,
    /// Assembly skipped because the output already matched.
    pub up_to_date: bool,
    pub presentation_digest: String,
    pub compiled_at: DateTime<Utc>,
}

/// A parsed input with its layer tree and directives.
pub struct LoadedDocument {
    pub document: Document,
    pub tree: LayerTree,
    pub directives: DirectiveSet,
}

/// The compilation pipeline - single entry point for every pass
pub struct CompilationPipeline {
    config: RunConfig,
    renderer: Box<dyn Renderer>,
    assembler: Box<dyn Assembler>,
}

impl CompilationPipeline {
    pub fn new(config: RunConfig, renderer: Box<dyn Renderer>, assembler: Box<dyn Assembler>) -> Self {
        Self {
            config,
            renderer,
            assembler,
        }
    }

    /// Inkscape plus whichever merger the configuration selects.
    pub fn from_config(config: RunConfig) -> Result<Self, PipelineError> {
        let renderer = Box::new(InkscapeRenderer::from_config(&config.renderer));
        let assembler = detect_assembler(config.assembler)?;
        log::debug!("Using {} to merge pages", assembler.name());
        Ok(Self::new(config, renderer, assembler))
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn load(&self, input: &Path) -> Result<LoadedDocument, PipelineError> {
        log::info!("Parsing {}", input.display());
        let document = Document::load(input)?;
        let tree = LayerTree::from_document(&document);
        let directives = parse_directives(&collect_text_elements(&document, &tree), &tree)?;
        log::debug!(
            "{} layers, {} sections, {} directive blocks",
            tree.len(),
            tree.sections().len(),
            directives.sources().len()
        );
        Ok(LoadedDocument {
            document,
            tree,
            directives,
        })
    }

    pub fn resolve_loaded(&self, loaded: &LoadedDocument) -> Result<Presentation, PipelineError> {
        let options = ResolveOptions {
            name_policy: self.config.name_policy,
            apply_master: self.config.apply_master,
            flat: self.config.flat,
        };
        let presentation = SlideResolver::new(&loaded.tree, &loaded.directives, options).resolve()?;
        if presentation.is_empty() {
            return Err(PipelineError::EmptyPresentation);
        }
        Ok(presentation)
    }

    /// Parse and resolve without rendering anything.
    pub fn resolve(&self, input: &Path) -> Result<Presentation, PipelineError> {
        let loaded = self.load(input)?;
        self.resolve_loaded(&loaded)
    }

    /// Run one full pass. On error the previous output, if any, is untouched.
    pub fn compile(
        &self,
        request: &CompileRequest,
        cancel: &CancelToken,
    ) -> Result<CompiledPresentation, PipelineError> {
        let output = request.output_path();
        let loaded = self.load(&request.input)?;
        let presentation = self.resolve_loaded(&loaded)?;
        log::info!("Resolved {} slides", presentation.len());

        let _output_lock = RunLock::for_output(&output)?;
        let _cache_lock = RunLock::for_cache_dir(&self.config.cache_dir_for(&request.input))?;
        let cache = self.open_cache(&request.input, request.temp)?;
        let previous = cache.load_manifest();

        let identity = self.renderer.identity();
        let builder = SnapshotBuilder::new(
            &loaded.document,
            &loaded.tree,
            &loaded.directives,
            Placeholders {
                number: &self.config.number_placeholder,
                frame: &self.config.frame_placeholder,
            },
        );
        let prepared = prepare_slides(&builder, &presentation, &identity);

        log::info!("Rendering with {} workers", self.config.jobs());
        let report = RenderDriver::new(self.renderer.as_ref(), &cache, self.config.jobs(), true)
            .render_all(&prepared, cancel)?;

        let fingerprints = report.fingerprints();
        let presentation_digest = digest(&presentation)?;
        let up_to_date = !cache.is_temporary()
            && report.all_reused()
            && output.is_file()
            && previous.map_or(false, |m| m.renderer == identity && m.pages == fingerprints);

        if up_to_date {
            log::info!("Presentation up to date: {}", output.display());
        } else {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            log::info!("Merging {} pages into {}", report.pages.len(), output.display());
            PageAssembler::new(self.assembler.as_ref()).assemble(&report.pages, &output)?;
        }

        if !cache.is_temporary() {
            cache.store_manifest(&CacheManifest::new(
                &identity,
                presentation_digest.clone(),
                fingerprints.clone(),
            ))?;
            let pruned = cache.prune(&fingerprints)?;
            if pruned > 0 {
                log::debug!("Pruned {} stale cache files", pruned);
            }
        }

        Ok(CompiledPresentation {
            output,
            slides: presentation.len(),
            rendered: report.rendered,
            reused: report.pages.iter().filter(|p| p.reused).count(),
            up_to_date,
            presentation_digest,
            compiled_at: Utc::now(),
        })
    }

    fn open_cache(&self, input: &Path, temp: bool) -> Result<CacheDir, PipelineError> {
        let root = self.config.cache_dir_for(input);

        if temp {
            if root.is_dir() {
                let removed = CacheDir::persistent(&root)?.purge()?;
                log::info!("Cleared {} cached files from {}", removed, root.display());
            }
            return CacheDir::temporary();
        }

        let cache = CacheDir::persistent(&root)?;
        if let Some(manifest) = cache.load_manifest() {
            if !manifest.is_compatible() {
                log::warn!(
                    "Cache was written by engine {}, discarding it",
                    manifest.engine_version
                );
                cache.purge()?;
            }
        }
        Ok(cache)
    }
}
