//! Run Configuration
//!
//! Loaded from `inkslides.json` next to the input (or `--config`); every
//! field has a default so an absent or partial file is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::layers::NamePolicy;
use crate::pipeline::PipelineError;

pub const CONFIG_FILE_NAME: &str = "inkslides.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub assembler: AssemblerKind,
    /// Render worker threads; `None` uses the available parallelism.
    #[serde(default)]
    pub jobs: Option<usize>,
    #[serde(default)]
    pub name_policy: NamePolicy,
    #[serde(default = "default_true")]
    pub apply_master: bool,
    /// One slide per top-level layer.
    #[serde(default)]
    pub flat: bool,
    #[serde(default = "default_number_placeholder")]
    pub number_placeholder: String,
    #[serde(default = "default_frame_placeholder")]
    pub frame_placeholder: String,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_watch_interval")]
    pub watch_interval_ms: u64,
}

fn default_true() -> bool { true }
fn default_number_placeholder() -> String { "#num#".to_string() }
fn default_frame_placeholder() -> String { "#frame_num#".to_string() }
fn default_watch_interval() -> u64 { 500 }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_program() -> String { "inkscape".to_string() }
fn default_timeout() -> u64 { 120 }

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            timeout_secs: default_timeout(),
        }
    }
}

impl RendererConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssemblerKind {
    /// First merger tool found on `PATH`.
    #[default]
    Auto,
    Pdfunite,
    Ghostscript,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            renderer: RendererConfig::default(),
            assembler: AssemblerKind::default(),
            jobs: None,
            name_policy: NamePolicy::default(),
            apply_master: true,
            flat: false,
            number_placeholder: default_number_placeholder(),
            frame_placeholder: default_frame_placeholder(),
            cache_dir: None,
            watch_interval_ms: default_watch_interval(),
        }
    }
}

impl RunConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// `explicit` if given, else `inkslides.json` beside `input`, else defaults.
    pub fn discover(input: &Path, explicit: Option<&Path>) -> Result<Self, PipelineError> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        let beside = input
            .parent()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .filter(|p| p.is_file());
        match beside {
            Some(path) => {
                log::info!("Using configuration {}", path.display());
                Self::load_from_file(&path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
            .filter(|j| *j > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    /// `<input dir>/.inkslides-<stem>` unless configured.
    pub fn cache_dir_for(&self, input: &Path) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "presentation".to_string());
        let parent = input.parent().unwrap_or_else(|| Path::new("."));
        parent.join(format!(".inkslides-{}", stem))
    }
}

/// `<input>.pdf` beside the input.
pub fn default_output_for(input: &Path) -> PathBuf {
    input.with_extension("pdf")
}
