//! InkSlides Core - layered SVG to PDF presentations
//!
//! A single Inkscape drawing holds every slide. Top-level layers are
//! sections, their sublayers slides or builds, and text directives
//! (`#master#`, `#import#`, `#content#`) share layers between slides.
//! Each slide is rendered to a page in parallel, cached by fingerprint,
//! and the pages merged into one PDF.

pub mod document;
pub mod layers;
pub mod directives;
pub mod resolver;
pub mod snapshot;
pub mod hashing;
pub mod render;
pub mod assemble;
pub mod cache;
pub mod config;
pub mod pipeline;
pub mod watch;

pub use document::{Document, DocumentError, NodeId};
pub use layers::{LayerId, LayerTree, NamePolicy};
pub use directives::{DirectiveKind, DirectiveSet, Entry, Sign};
pub use resolver::{Presentation, ResolveOptions, SlideResolver, SlideSpec, VisibleLayer};
pub use hashing::{digest, sha256_hex, slide_fingerprint};
pub use render::{CancelToken, InkscapeRenderer, Renderer};
pub use assemble::{Assembler, GhostscriptAssembler, PopplerAssembler};
pub use config::RunConfig;
pub use pipeline::{CompilationPipeline, CompileRequest, CompiledPresentation, PipelineError};
pub use watch::Watcher;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
