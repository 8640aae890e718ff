//! Page cache and run lock
//!
//! Pages are stored as `<fingerprint>.pdf`. `manifest.json` records the
//! page order of the last successful pass.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::pipeline::PipelineError;
use crate::ENGINE_VERSION;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const LOCK_FILE: &str = ".lock";
pub const PAGE_EXTENSION: &str = "pdf";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheManifest {
    pub engine_version: String,
    pub renderer: String,
    pub created_at: DateTime<Utc>,
    pub presentation_digest: String,
    /// Page fingerprints in presentation order.
    pub pages: Vec<String>,
}

impl CacheManifest {
    pub fn new(renderer: &str, presentation_digest: String, pages: Vec<String>) -> Self {
        Self {
            engine_version: ENGINE_VERSION.to_string(),
            renderer: renderer.to_string(),
            created_at: Utc::now(),
            presentation_digest,
            pages,
        }
    }

    /// Caret-compatible with the running engine.
    pub fn is_compatible(&self) -> bool {
        let Ok(req) = VersionReq::parse(&format!("^{}", self.engine_version)) else {
            return false;
        };
        Version::parse(ENGINE_VERSION).map_or(false, |v| req.matches(&v))
    }
}

#[derive(Debug)]
pub struct CacheDir {
    root: PathBuf,
    temp: Option<TempDir>,
}

impl CacheDir {
    pub fn persistent(root: &Path) -> Result<Self, PipelineError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            temp: None,
        })
    }

    /// Throwaway directory, removed on drop.
    pub fn temporary() -> Result<Self, PipelineError> {
        let temp = tempfile::Builder::new().prefix("inkslides-").tempdir()?;
        Ok(Self {
            root: temp.path().to_path_buf(),
            temp: Some(temp),
        })
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{}.{}", fingerprint, PAGE_EXTENSION))
    }

    /// Where a page is rendered before it is moved to [`Self::page_path`].
    /// Never listed in a manifest, so `prune` sweeps leftovers.
    pub fn staging_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{}.part.{}", fingerprint, PAGE_EXTENSION))
    }

    pub fn snapshot_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{}.svg", fingerprint))
    }

    pub fn load_manifest(&self) -> Option<CacheManifest> {
        let content = fs::read_to_string(self.root.join(MANIFEST_FILE)).ok()?;
        match serde_json::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                log::warn!("Ignoring unreadable cache manifest: {}", e);
                None
            }
        }
    }

    pub fn store_manifest(&self, manifest: &CacheManifest) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(self.root.join(MANIFEST_FILE), json)?;
        Ok(())
    }

    /// Remove every cached page, snapshot and the manifest.
    pub fn purge(&self) -> Result<usize, PipelineError> {
        let mut removed = 0;
        for path in self.cache_files()? {
            fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove pages and snapshots whose fingerprint is not in `keep`.
    pub fn prune(&self, keep: &[String]) -> Result<usize, PipelineError> {
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
        let mut removed = 0;
        for path in self.cache_files()? {
            if path.file_name().map_or(false, |n| n == MANIFEST_FILE) {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if !keep.contains(stem) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn cache_files(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let mut files = Vec::new();
        if !self.root.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let ours = path.file_name().map_or(false, |n| n == MANIFEST_FILE)
                || path
                    .extension()
                    .map_or(false, |e| e == PAGE_EXTENSION || e == "svg");
            if ours && path.is_file() {
                files.push(path);
            }
        }
        Ok(files)
    }
}

/// Exclusive marker file held for the duration of one pass. It records
/// the holder's process id; a lock whose holder has exited is taken over.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn for_output(output: &Path) -> Result<Self, PipelineError> {
        let mut name = output.as_os_str().to_owned();
        name.push(".lock");
        Self::acquire(PathBuf::from(name))
    }

    /// Passes writing to different outputs still share the page cache.
    pub fn for_cache_dir(root: &Path) -> Result<Self, PipelineError> {
        fs::create_dir_all(root)?;
        Self::acquire(root.join(LOCK_FILE))
    }

    pub fn acquire(path: PathBuf) -> Result<Self, PipelineError> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match lock_holder(&path) {
                    Some(pid) if !process_alive(pid) => {
                        log::warn!("Removing stale lock {} left by process {}", path.display(), pid);
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    _ => return Err(PipelineError::CacheLocked(path)),
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(PipelineError::CacheLocked(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return true;
    };
    // Signal 0 checks for existence without delivering anything.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Could not release lock {}: {}", self.path.display(), e);
        }
    }
}
