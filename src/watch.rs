//! Watch mode
//!
//! Polls the input's modification time. A change cancels the pass in
//! flight, waits for it to let go of the run lock and starts a new one.
//! Failed passes are logged; the loop keeps going until stopped.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::SystemTime;

use crate::pipeline::{CompilationPipeline, CompileRequest, CompiledPresentation, PipelineError};
use crate::render::CancelToken;

/// Reports whether a file's mtime moved since the last poll.
#[derive(Debug)]
pub struct FileWatcher {
    path: PathBuf,
    last: Option<SystemTime>,
}

impl FileWatcher {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            last: modified(path),
        }
    }

    pub fn poll(&mut self) -> bool {
        let current = modified(&self.path);
        if current == self.last {
            return false;
        }
        self.last = current;
        // Vanishing mid-save is not a change worth rebuilding for.
        current.is_some()
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

struct Pass<'scope> {
    cancel: CancelToken,
    handle: ScopedJoinHandle<'scope, Result<CompiledPresentation, PipelineError>>,
}

impl Pass<'_> {
    /// Wait for the pass and log its outcome. Returns 1 if it ran to an end.
    fn finish(self) -> usize {
        match self.handle.join() {
            Ok(Ok(compiled)) => {
                log::info!(
                    "Wrote {} ({} slides, {} rendered)",
                    compiled.output.display(),
                    compiled.slides,
                    compiled.rendered
                );
                1
            }
            Ok(Err(PipelineError::Cancelled)) => {
                log::debug!("Pass cancelled");
                0
            }
            Ok(Err(e)) => {
                log::error!("{}", e);
                1
            }
            Err(_) => {
                log::error!("Pass panicked");
                0
            }
        }
    }
}

pub struct Watcher<'a> {
    pipeline: &'a CompilationPipeline,
    request: CompileRequest,
}

impl<'a> Watcher<'a> {
    pub fn new(pipeline: &'a CompilationPipeline, request: CompileRequest) -> Self {
        Self { pipeline, request }
    }

    /// Blocks until `stop` is cancelled. Returns the number of passes that
    /// finished, successfully or not.
    pub fn run(&self, stop: &CancelToken) -> usize {
        let interval = self.pipeline.config().watch_interval();
        let mut watcher = FileWatcher::new(&self.request.input);
        let mut finished = 0;

        log::info!("Watching {}", self.request.input.display());
        thread::scope(|scope| {
            let mut current = Some(self.start_pass(scope));

            while !stop.is_cancelled() {
                thread::sleep(interval);

                if watcher.poll() {
                    log::info!("{} changed, rebuilding", self.request.input.display());
                    if let Some(pass) = current.take() {
                        pass.cancel.cancel();
                        finished += pass.finish();
                    }
                    current = Some(self.start_pass(scope));
                } else if current.as_ref().map_or(false, |p| p.handle.is_finished()) {
                    if let Some(pass) = current.take() {
                        finished += pass.finish();
                    }
                }
            }

            if let Some(pass) = current.take() {
                pass.cancel.cancel();
                finished += pass.finish();
            }
        });
        finished
    }

    fn start_pass<'scope, 'env: 'scope>(&'env self, scope: &'scope Scope<'scope, 'env>) -> Pass<'scope> {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = scope.spawn(move || self.pipeline.compile(&self.request, &token));
        Pass { cancel, handle }
    }
}
