//! InkSlides CLI
//!
//! Commands: run, resolve
//! `run` writes the PDF and prints a JSON summary to stdout.
//! `resolve` prints the slide list as JSON without rendering.
//! Progress goes to stderr through env_logger.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use inkslides_core::{
    CancelToken, CompilationPipeline, CompileRequest, NamePolicy, PipelineError, RunConfig, Watcher,
};

#[derive(Parser)]
#[command(name = "inkslides")]
#[command(version, about = "InkSlides - layered SVG to PDF presentations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log every slide (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a presentation
    Run {
        /// Inkscape SVG with one layer per section
        input: PathBuf,

        /// Ignore and clear the page cache, render into a temporary directory
        #[arg(short, long)]
        temp: bool,

        /// Rebuild whenever the input changes
        #[arg(short, long)]
        watch: bool,

        /// Output PDF (default: input with .pdf extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Configuration file (default: inkslides.json beside the input)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Render worker threads
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Do not apply the #master# directive
        #[arg(long)]
        no_master: bool,

        /// Resolve ambiguous layer names to the first match
        #[arg(long)]
        first_match: bool,

        /// One slide per top-level layer, ignoring sublayers
        #[arg(long)]
        flat: bool,
    },

    /// Print the resolved slides without rendering
    Resolve {
        input: PathBuf,

        /// Configuration file (default: inkslides.json beside the input)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Resolve ambiguous layer names to the first match
        #[arg(long)]
        first_match: bool,

        /// One slide per top-level layer, ignoring sublayers
        #[arg(long)]
        flat: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Commands::Run {
            input,
            temp,
            watch,
            output,
            config,
            jobs,
            no_master,
            first_match,
            flat,
        } => load_config(&input, config.as_deref()).and_then(|mut config| {
            if jobs.is_some() {
                config.jobs = jobs;
            }
            if no_master {
                config.apply_master = false;
            }
            if first_match {
                config.name_policy = NamePolicy::First;
            }
            if flat {
                config.flat = true;
            }
            let request = CompileRequest {
                input,
                output,
                temp,
            };
            run(config, request, watch)
        }),

        Commands::Resolve {
            input,
            config,
            first_match,
            flat,
        } => load_config(&input, config.as_deref()).and_then(|mut config| {
            if first_match {
                config.name_policy = NamePolicy::First;
            }
            if flat {
                config.flat = true;
            }
            resolve(config, &input)
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(input: &Path, explicit: Option<&Path>) -> Result<RunConfig, PipelineError> {
    RunConfig::discover(input, explicit)
}

fn run(config: RunConfig, request: CompileRequest, watch: bool) -> Result<(), PipelineError> {
    let pipeline = CompilationPipeline::from_config(config)?;

    if watch {
        // Runs until the process is interrupted.
        Watcher::new(&pipeline, request).run(&CancelToken::new());
        return Ok(());
    }

    let compiled = pipeline.compile(&request, &CancelToken::new())?;
    log::info!(
        "Wrote {} ({} slides, {} rendered, {} cached)",
        compiled.output.display(),
        compiled.slides,
        compiled.rendered,
        compiled.reused
    );
    println!("{}", serde_json::to_string_pretty(&compiled)?);
    Ok(())
}

fn resolve(config: RunConfig, input: &Path) -> Result<(), PipelineError> {
    let renderer = Box::new(inkslides_core::InkscapeRenderer::from_config(&config.renderer));
    // Nothing is merged here, so any backend will do.
    let pipeline = CompilationPipeline::new(config, renderer, Box::new(inkslides_core::PopplerAssembler));
    let presentation = pipeline.resolve(input)?;
    println!("{}", serde_json::to_string_pretty(&presentation)?);
    Ok(())
}
