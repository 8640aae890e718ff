//! Visibility Renderer Driver
//!
//! Each slide becomes a snapshot, the snapshot a fingerprint, and the
//! fingerprint a page in the cache. Pages already present are reused
//! unless reuse is disabled; the rest are rendered on a bounded pool.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::cache::CacheDir;
use crate::config::RendererConfig;
use crate::hashing::slide_fingerprint;
use crate::pipeline::PipelineError;
use crate::resolver::Presentation;
use crate::snapshot::SnapshotBuilder;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// External collaborator turning one snapshot into one page.
pub trait Renderer: Send + Sync {
    /// Folded into every fingerprint, so changing it invalidates pages.
    fn identity(&self) -> String;

    fn render(&self, snapshot: &Path, page: &Path) -> Result<(), String>;
}

pub struct InkscapeRenderer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl InkscapeRenderer {
    pub fn from_config(config: &RendererConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
        }
    }
}

impl Renderer for InkscapeRenderer {
    fn identity(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn render(&self, snapshot: &Path, page: &Path) -> Result<(), String> {
        let mut command = Command::new(&self.program);
        command
            .arg(snapshot)
            .arg("--export-type=pdf")
            .arg(format!("--export-filename={}", page.display()))
            .args(&self.args);
        run_with_timeout(command, &self.program, self.timeout)
    }
}

/// Run `command` to completion, killing it once `timeout` has passed.
pub fn run_with_timeout(mut command: Command, program: &str, timeout: Duration) -> Result<(), String> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("cannot start {}: {}", program, e))?;

    // Drained on its own thread so a chatty child cannot fill the pipe.
    let stderr = child.stderr.take();
    let reader = thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    });

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => return Err(format!("waiting for {} failed: {}", program, e)),
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(format!("{} timed out after {}s", program, timeout.as_secs()));
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stderr = reader.join().unwrap_or_default();
    if status.success() {
        Ok(())
    } else {
        Err(format!("{} exited with {}: {}", program, status, stderr.trim()))
    }
}

/// Shared flag telling a pass to stop starting new renders.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PreparedSlide {
    pub index: usize,
    pub section: String,
    pub description: String,
    pub snapshot: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub index: usize,
    pub fingerprint: String,
    pub path: PathBuf,
    pub reused: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RenderReport {
    pub pages: Vec<RenderedPage>,
    /// Renderer invocations this pass.
    pub rendered: usize,
}

impl RenderReport {
    pub fn all_reused(&self) -> bool {
        self.rendered == 0
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.pages.iter().map(|p| p.fingerprint.clone()).collect()
    }
}

/// Snapshots and fingerprints for every slide. Pure, so done in parallel.
pub fn prepare_slides(
    builder: &SnapshotBuilder<'_>,
    presentation: &Presentation,
    renderer_identity: &str,
) -> Vec<PreparedSlide> {
    presentation
        .slides
        .par_iter()
        .map(|slide| {
            let snapshot = builder.build(slide);
            PreparedSlide {
                index: slide.index,
                section: slide.section.clone(),
                description: slide.describe(),
                fingerprint: slide_fingerprint(renderer_identity, &snapshot),
                snapshot,
            }
        })
        .collect()
}

pub struct RenderDriver<'a> {
    renderer: &'a dyn Renderer,
    cache: &'a CacheDir,
    jobs: usize,
    reuse: bool,
}

impl<'a> RenderDriver<'a> {
    pub fn new(renderer: &'a dyn Renderer, cache: &'a CacheDir, jobs: usize, reuse: bool) -> Self {
        Self {
            renderer,
            cache,
            jobs: jobs.max(1),
            reuse,
        }
    }

    pub fn render_all(
        &self,
        slides: &[PreparedSlide],
        cancel: &CancelToken,
    ) -> Result<RenderReport, PipelineError> {
        // Identical slides share one page and one render.
        let mut unique: Vec<&PreparedSlide> = Vec::new();
        let mut seen = HashSet::new();
        for slide in slides {
            if seen.insert(slide.fingerprint.as_str()) {
                unique.push(slide);
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs)
            .build()
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;

        let outcomes: Vec<(String, bool)> = pool.install(|| {
            unique
                .par_iter()
                .map(|slide| self.render_one(slide, cancel))
                .collect::<Result<Vec<_>, _>>()
        })?;
        let reused: HashMap<String, bool> = outcomes.iter().cloned().collect();
        let rendered = outcomes.iter().filter(|(_, r)| !r).count();

        let pages = slides
            .iter()
            .map(|slide| RenderedPage {
                index: slide.index,
                fingerprint: slide.fingerprint.clone(),
                path: self.cache.page_path(&slide.fingerprint),
                reused: reused.get(&slide.fingerprint).copied().unwrap_or(false),
            })
            .collect();

        Ok(RenderReport { pages, rendered })
    }

    /// Returns the fingerprint and whether the cached page was reused.
    fn render_one(&self, slide: &PreparedSlide, cancel: &CancelToken) -> Result<(String, bool), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let page = self.cache.page_path(&slide.fingerprint);
        if self.reuse && page.is_file() {
            log::debug!("Slide {} ({}) is cached", slide.index + 1, slide.section);
            return Ok((slide.fingerprint.clone(), true));
        }

        let snapshot = self.cache.snapshot_path(&slide.fingerprint);
        let staging = self.cache.staging_path(&slide.fingerprint);
        fs::write(&snapshot, &slide.snapshot)?;

        let failure = |message: String| PipelineError::RenderFailure {
            index: slide.index + 1,
            section: slide.section.clone(),
            layers: slide.description.clone(),
            message,
        };

        // Only a finished render is moved to the page path; whatever a
        // failed or killed renderer left behind is discarded.
        let result = self.renderer.render(&snapshot, &staging).and_then(|()| {
            if staging.is_file() {
                fs::rename(&staging, &page).map_err(|e| format!("cannot store page: {}", e))
            } else {
                Err(format!("renderer produced no page at {}", staging.display()))
            }
        });
        for leftover in [&snapshot, &staging] {
            if leftover.exists() {
                if let Err(e) = fs::remove_file(leftover) {
                    log::debug!("Could not remove {}: {}", leftover.display(), e);
                }
            }
        }
        result.map_err(failure)?;

        log::info!("  Rendered slide {} ({})", slide.index + 1, slide.section);
        Ok((slide.fingerprint.clone(), false))
    }
}
