//! Page Assembler
//!
//! Concatenates rendered pages in presentation order. The result goes to a
//! temporary file beside the target and is only persisted once complete.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::config::AssemblerKind;
use crate::pipeline::PipelineError;
use crate::render::{run_with_timeout, RenderedPage};

const MERGE_TIMEOUT: Duration = Duration::from_secs(300);

/// External collaborator merging single-page files into one document.
pub trait Assembler: Send + Sync {
    fn name(&self) -> &'static str;

    fn concatenate(&self, pages: &[PathBuf], output: &Path) -> Result<(), String>;
}

/// `pdfunite` from Poppler.
pub struct PopplerAssembler;

impl Assembler for PopplerAssembler {
    fn name(&self) -> &'static str {
        "pdfunite"
    }

    fn concatenate(&self, pages: &[PathBuf], output: &Path) -> Result<(), String> {
        let mut command = Command::new("pdfunite");
        command.args(pages).arg(output);
        run_with_timeout(command, self.name(), MERGE_TIMEOUT)
    }
}

/// Ghostscript's `pdfwrite` device, shipped with most TeX installations.
pub struct GhostscriptAssembler;

impl Assembler for GhostscriptAssembler {
    fn name(&self) -> &'static str {
        "gs"
    }

    fn concatenate(&self, pages: &[PathBuf], output: &Path) -> Result<(), String> {
        let mut command = Command::new("gs");
        command
            .args(["-dBATCH", "-dNOPAUSE", "-q", "-sDEVICE=pdfwrite", "-dPDFSETTINGS=/prepress"])
            .arg(format!("-sOutputFile={}", output.display()))
            .args(pages);
        run_with_timeout(command, self.name(), MERGE_TIMEOUT)
    }
}

/// Pick a backend, probing `PATH` for `auto`.
pub fn detect_assembler(kind: AssemblerKind) -> Result<Box<dyn Assembler>, PipelineError> {
    match kind {
        AssemblerKind::Pdfunite => Ok(Box::new(PopplerAssembler)),
        AssemblerKind::Ghostscript => Ok(Box::new(GhostscriptAssembler)),
        AssemblerKind::Auto => {
            if find_on_path("pdfunite").is_some() {
                Ok(Box::new(PopplerAssembler))
            } else if find_on_path("gs").is_some() {
                Ok(Box::new(GhostscriptAssembler))
            } else {
                Err(PipelineError::NoAssembler)
            }
        }
    }
}

pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).map_or(false, |m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

pub struct PageAssembler<'a> {
    assembler: &'a dyn Assembler,
}

impl<'a> PageAssembler<'a> {
    pub fn new(assembler: &'a dyn Assembler) -> Self {
        Self { assembler }
    }

    pub fn assemble(&self, pages: &[RenderedPage], output: &Path) -> Result<(), PipelineError> {
        if pages.is_empty() {
            return Err(PipelineError::AssemblyFailure("no pages to assemble".to_string()));
        }
        if let Some(missing) = pages.iter().find(|p| !p.path.is_file()) {
            return Err(PipelineError::AssemblyFailure(format!(
                "page for slide {} is missing at {}",
                missing.index + 1,
                missing.path.display()
            )));
        }

        let dir = match output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let staging = tempfile::Builder::new()
            .prefix(".inkslides-")
            .suffix(".pdf")
            .tempfile_in(dir)?;

        let paths: Vec<PathBuf> = pages.iter().map(|p| p.path.clone()).collect();
        if let [single] = paths.as_slice() {
            fs::copy(single, staging.path())?;
        } else {
            log::debug!("Merging {} pages with {}", paths.len(), self.assembler.name());
            self.assembler
                .concatenate(&paths, staging.path())
                .map_err(PipelineError::AssemblyFailure)?;
        }

        staging
            .persist(output)
            .map_err(|e| PipelineError::AssemblyFailure(format!("cannot write {}: {}", output.display(), e)))?;
        Ok(())
    }
}
