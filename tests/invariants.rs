//! Contract Invariant Tests
//!
//! These drive the whole pipeline with in-process fakes for the renderer
//! and the merger, so they need neither Inkscape nor Poppler.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use inkslides_core::cache::RunLock;
use inkslides_core::{
    Assembler, CancelToken, CompilationPipeline, CompileRequest, CompiledPresentation,
    PipelineError, Presentation, Renderer, RunConfig,
};
use tempfile::TempDir;

/// Copies the snapshot to the page. On a snapshot containing `fail_on` it
/// writes a truncated page and then fails, like a renderer killed mid-write.
struct FakeRenderer {
    calls: Arc<AtomicUsize>,
    fail_on: Option<&'static str>,
}

impl Renderer for FakeRenderer {
    fn identity(&self) -> String {
        "fake-renderer 1".to_string()
    }

    fn render(&self, snapshot: &Path, page: &Path) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let svg = fs::read_to_string(snapshot).map_err(|e| e.to_string())?;
        if let Some(marker) = self.fail_on {
            if svg.contains(marker) {
                fs::write(page, "%PDF-truncated").map_err(|e| e.to_string())?;
                return Err("renderer crashed".to_string());
            }
        }
        fs::write(page, svg).map_err(|e| e.to_string())
    }
}

/// Writes a `PAGE` marker before each page's bytes.
struct FakeAssembler {
    calls: Arc<AtomicUsize>,
}

impl Assembler for FakeAssembler {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn concatenate(&self, pages: &[PathBuf], output: &Path) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = String::new();
        for page in pages {
            out.push_str("PAGE\n");
            out.push_str(&fs::read_to_string(page).map_err(|e| e.to_string())?);
        }
        fs::write(output, out).map_err(|e| e.to_string())
    }
}

struct Harness {
    dir: TempDir,
    renders: Arc<AtomicUsize>,
    merges: Arc<AtomicUsize>,
    fail_on: Option<&'static str>,
    config: RunConfig,
}

impl Harness {
    fn new(svg: &str) -> Self {
        let harness = Self {
            dir: tempfile::tempdir().unwrap(),
            renders: Arc::new(AtomicUsize::new(0)),
            merges: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
            config: RunConfig {
                jobs: Some(4),
                ..RunConfig::default()
            },
        };
        harness.write(svg);
        harness
    }

    fn input(&self) -> PathBuf {
        self.dir.path().join("talk.svg")
    }

    fn output(&self) -> PathBuf {
        self.dir.path().join("talk.pdf")
    }

    fn write(&self, svg: &str) {
        fs::write(self.input(), svg).unwrap();
    }

    fn pipeline(&self) -> CompilationPipeline {
        CompilationPipeline::new(
            self.config.clone(),
            Box::new(FakeRenderer {
                calls: self.renders.clone(),
                fail_on: self.fail_on,
            }),
            Box::new(FakeAssembler {
                calls: self.merges.clone(),
            }),
        )
    }

    fn compile(&self, temp: bool) -> Result<CompiledPresentation, PipelineError> {
        self.compile_to(self.output(), temp)
    }

    fn compile_to(
        &self,
        output: PathBuf,
        temp: bool,
    ) -> Result<CompiledPresentation, PipelineError> {
        let request = CompileRequest {
            input: self.input(),
            output: Some(output),
            temp,
        };
        self.pipeline().compile(&request, &CancelToken::new())
    }

    fn resolve(&self) -> Presentation {
        self.pipeline().resolve(&self.input()).unwrap()
    }

    fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    fn cache_dir(&self) -> PathBuf {
        self.config.cache_dir_for(&self.input())
    }
}

fn svg(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" xmlns:inkscape="http://www.inkscape.org/namespaces/inkscape" xmlns:sodipodi="http://sodipodi.sourceforge.net/DTD/sodipodi-0.dtd" width="800" height="600"><sodipodi:namedview id="view"/>{}</svg>"#,
        body
    )
}

fn layer(name: &str, body: &str) -> String {
    format!(
        r#"<g inkscape:groupmode="layer" inkscape:label="{}" style="display:none">{}</g>"#,
        name, body
    )
}

fn text(lines: &[&str]) -> String {
    let spans: String = lines
        .iter()
        .map(|l| format!("<tspan>{}</tspan>", l))
        .collect();
    format!("<text>{}</text>", spans)
}

fn polar_bears(arg3: &str) -> String {
    svg(&[
        layer("Title", &layer("Welcome", r#"<rect id="welcome"/>"#)),
        layer(
            "PolarBears",
            &[
                layer(
                    "WhyCool",
                    &[
                        layer("Arg1", r#"<rect id="arg1"/>"#),
                        layer("Arg2", r#"<rect id="arg2"/>"#),
                        layer("Arg3", arg3),
                    ]
                    .concat(),
                ),
                layer("Weaknesses", r#"<rect id="weak"/>"#),
            ]
            .concat(),
        ),
    ]
    .concat())
}

fn slide_names(presentation: &Presentation) -> Vec<Vec<String>> {
    presentation
        .iter()
        .map(|s| {
            let mut names: Vec<String> = s.names().into_iter().map(String::from).collect();
            names.sort();
            names
        })
        .collect()
}

fn sorted(names: &[&str]) -> Vec<String> {
    let mut names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    names.sort();
    names
}

#[test]
fn invariant_polar_bears_example() {
    let harness = Harness::new(&polar_bears(r#"<rect id="arg3"/>"#));

    assert_eq!(
        slide_names(&harness.resolve()),
        vec![
            sorted(&["Title", "Welcome"]),
            sorted(&["PolarBears", "WhyCool", "Arg1"]),
            sorted(&["PolarBears", "WhyCool", "Arg1", "Arg2"]),
            sorted(&["PolarBears", "WhyCool", "Arg1", "Arg2", "Arg3"]),
            sorted(&["PolarBears", "Weaknesses"]),
        ]
    );

    let compiled = harness.compile(false).unwrap();
    assert_eq!(compiled.slides, 5);
    assert_eq!(compiled.rendered, 5);

    let pdf = fs::read_to_string(harness.output()).unwrap();
    assert_eq!(pdf.matches("PAGE\n").count(), 5);
    let welcome = pdf.find(r#"id="welcome""#).unwrap();
    let weak = pdf.find(r#"id="weak""#).unwrap();
    assert!(welcome < weak);
}

#[test]
fn invariant_frames_are_cumulative() {
    let harness = Harness::new(&polar_bears(r#"<rect id="arg3"/>"#));
    let presentation = harness.resolve();

    let builds: Vec<_> = presentation
        .iter()
        .filter(|s| s.names().contains(&"WhyCool"))
        .collect();
    assert_eq!(builds.len(), 3);
    for pair in builds.windows(2) {
        assert!(pair[0].layers.iter().all(|l| pair[1].contains(l.id)));
        assert!(pair[1].layers.len() > pair[0].layers.len());
    }
}

#[test]
fn invariant_second_run_renders_nothing() {
    let harness = Harness::new(&polar_bears(r#"<rect id="arg3"/>"#));

    let first = harness.compile(false).unwrap();
    let second = harness.compile(false).unwrap();

    assert_eq!(harness.renders(), 5);
    assert_eq!(second.rendered, 0);
    assert_eq!(second.reused, 5);
    assert!(second.up_to_date);
    assert_eq!(harness.merges.load(Ordering::SeqCst), 1);
    assert_eq!(first.presentation_digest, second.presentation_digest);
    assert_eq!(harness.resolve(), harness.resolve());
}

#[test]
fn invariant_edit_rerenders_only_affected_slides() {
    let harness = Harness::new(&polar_bears(r#"<rect id="arg3"/>"#));
    harness.compile(false).unwrap();

    harness.write(&polar_bears(r#"<circle id="arg3-new"/>"#));
    let compiled = harness.compile(false).unwrap();

    assert_eq!(compiled.rendered, 1);
    assert!(!compiled.up_to_date);
    assert!(fs::read_to_string(harness.output()).unwrap().contains("arg3-new"));

    let cached_pages = fs::read_dir(harness.cache_dir())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().path().extension().map_or(false, |x| x == "pdf"))
        .count();
    assert_eq!(cached_pages, 5);
}

#[test]
fn invariant_unknown_layer_fails_before_rendering() {
    let harness = Harness::new(&svg(&layer(
        "Talk",
        &text(&["#import#", "Ghost"]),
    )));

    let err = harness.compile(false).unwrap_err();
    match err {
        PipelineError::UnknownLayerReference { name, scope } => {
            assert_eq!(name, "Ghost");
            assert_eq!(scope, "Talk");
        }
        other => panic!("expected UnknownLayerReference, got {:?}", other),
    }
    assert_eq!(harness.renders(), 0);
    assert!(!harness.output().exists());
}

#[test]
fn invariant_failed_render_keeps_previous_output() {
    let mut harness = Harness::new(&polar_bears(r#"<rect id="arg3"/>"#));
    harness.compile(false).unwrap();
    let before = fs::read_to_string(harness.output()).unwrap();

    harness.fail_on = Some("BROKEN");
    harness.write(&polar_bears(r#"<rect id="BROKEN"/>"#));
    let err = harness.compile(false).unwrap_err();

    match err {
        PipelineError::RenderFailure {
            index,
            section,
            layers,
            message,
        } => {
            assert_eq!(index, 4);
            assert_eq!(section, "PolarBears");
            assert!(layers.contains("Arg3"));
            assert_eq!(message, "renderer crashed");
        }
        other => panic!("expected RenderFailure, got {:?}", other),
    }
    assert_eq!(fs::read_to_string(harness.output()).unwrap(), before);
    assert!(!harness.dir.path().join("talk.pdf.lock").exists());
}

#[test]
fn invariant_failed_first_render_writes_nothing() {
    let mut harness = Harness::new(&polar_bears(r#"<rect id="BROKEN"/>"#));
    harness.fail_on = Some("BROKEN");

    assert!(harness.compile(false).is_err());
    assert!(!harness.output().exists());
    assert_eq!(harness.merges.load(Ordering::SeqCst), 0);
}

#[test]
fn invariant_failed_render_never_poisons_the_cache() {
    let mut harness = Harness::new(&polar_bears(r#"<rect id="BROKEN"/>"#));
    harness.fail_on = Some("BROKEN");
    assert!(matches!(
        harness.compile(false),
        Err(PipelineError::RenderFailure { index: 4, .. })
    ));

    for entry in fs::read_dir(harness.cache_dir()).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(!name.contains(".part"), "staging file left behind: {}", name);
        assert!(!fs::read_to_string(&path).unwrap_or_default().contains("%PDF-truncated"));
    }

    harness.fail_on = None;
    let compiled = harness.compile(false).unwrap();
    assert!(compiled.rendered >= 1);
    assert_eq!(compiled.rendered + compiled.reused, 5);
    let pdf = fs::read_to_string(harness.output()).unwrap();
    assert!(!pdf.contains("%PDF-truncated"));
    assert!(pdf.contains("BROKEN"));
}

#[test]
fn invariant_temp_run_rerenders_and_clears_cache() {
    let harness = Harness::new(&polar_bears(r#"<rect id="arg3"/>"#));
    harness.compile(false).unwrap();

    let compiled = harness.compile(true).unwrap();
    assert_eq!(compiled.rendered, 5);
    assert!(!compiled.up_to_date);

    let leftovers = fs::read_dir(harness.cache_dir()).unwrap().count();
    assert_eq!(leftovers, 0);

    let again = harness.compile(false).unwrap();
    assert_eq!(again.rendered, 5);
    assert_eq!(harness.renders(), 15);
}

#[test]
fn invariant_held_lock_blocks_the_run() {
    let harness = Harness::new(&polar_bears(r#"<rect id="arg3"/>"#));
    let lock = harness.dir.path().join("talk.pdf.lock");
    fs::write(&lock, std::process::id().to_string()).unwrap();

    assert!(matches!(harness.compile(false), Err(PipelineError::CacheLocked(p)) if p == lock));
    assert_eq!(harness.renders(), 0);
    assert!(lock.exists());
}

#[test]
fn invariant_one_pass_per_cache_whatever_the_output() {
    let harness = Harness::new(&polar_bears(r#"<rect id="arg3"/>"#));
    let cache_lock = RunLock::for_cache_dir(&harness.cache_dir()).unwrap();

    let other = harness.dir.path().join("handout.pdf");
    let err = harness.compile_to(other.clone(), false).unwrap_err();
    assert!(matches!(err, PipelineError::CacheLocked(ref p) if p == cache_lock.path()));
    assert_eq!(harness.renders(), 0);

    drop(cache_lock);
    harness.compile_to(other.clone(), false).unwrap();
    assert!(other.is_file());
}

#[cfg(unix)]
#[test]
fn invariant_lock_of_a_dead_run_is_reclaimed() {
    let harness = Harness::new(&polar_bears(r#"<rect id="arg3"/>"#));
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead = child.id();
    child.wait().unwrap();
    let lock = harness.dir.path().join("talk.pdf.lock");
    fs::write(&lock, dead.to_string()).unwrap();

    harness.compile(false).unwrap();
    assert!(harness.output().is_file());
    assert!(!lock.exists());
}

#[test]
fn invariant_imported_section_keeps_its_slides() {
    let harness = Harness::new(&svg(&[
        layer("Intro", &[layer("Hello", ""), layer("Agenda", "")].concat()),
        layer("Outro", &[text(&["#import#", "Intro"]), layer("Bye", "")].concat()),
    ]
    .concat()));

    let presentation = harness.resolve();
    let sections: Vec<&str> = presentation.iter().map(|s| s.section.as_str()).collect();
    assert_eq!(sections, vec!["Intro", "Outro"]);
    assert!(presentation.slides[1].names().contains(&"Agenda"));
}

#[test]
fn invariant_slide_and_page_numbers() {
    let numbered = r#"<text><tspan>#num#</tspan></text><text><tspan>#frame_num#</tspan></text>"#;
    let harness = Harness::new(&svg(&[
        layer("Logo", &[text(&["#master#", "Logo"]), numbered.to_string()].concat()),
        layer("Title", &layer("Welcome", "")),
        layer(
            "Bears",
            &layer("Build", &[layer("F1", ""), layer("F2", "")].concat()),
        ),
    ]
    .concat()));

    harness.compile(false).unwrap();
    let pdf = fs::read_to_string(harness.output()).unwrap();
    let pages: Vec<&str> = pdf.split("PAGE\n").filter(|p| !p.is_empty()).collect();
    let expected = [(1, 0), (2, 1), (2, 2)];
    assert_eq!(pages.len(), expected.len());
    for (page, (number, frame)) in pages.iter().zip(expected) {
        let stamped = format!("<tspan>{}</tspan></text><text><tspan>{}</tspan>", number, frame);
        assert!(page.contains(&stamped), "page lacks {}", stamped);
    }
}

#[test]
fn invariant_flat_mode_ignores_sublayers() {
    let mut harness = Harness::new(&polar_bears(r#"<rect id="arg3"/>"#));
    harness.config.flat = true;

    let presentation = harness.resolve();
    let names: Vec<Vec<&str>> = presentation.iter().map(|s| s.names()).collect();
    assert_eq!(names, vec![vec!["Title"], vec!["PolarBears"]]);

    harness.compile(false).unwrap();
    let pdf = fs::read_to_string(harness.output()).unwrap();
    assert_eq!(pdf.matches("PAGE\n").count(), 2);
    assert!(!pdf.contains(r#"id="arg1""#));
}

#[test]
fn invariant_first_master_wins() {
    let harness = Harness::new(&svg(&[
        text(&["#master#", "LogoA"]),
        text(&["#master#", "LogoB"]),
        layer("LogoA", r#"<circle id="a"/>"#),
        layer("LogoB", r#"<circle id="b"/>"#),
        layer("Talk", r#"<rect id="talk"/>"#),
    ]
    .concat()));

    let presentation = harness.resolve();
    let talk = presentation.iter().find(|s| s.section == "Talk").unwrap();
    assert!(talk.names().contains(&"LogoA"));
    assert!(!talk.names().contains(&"LogoB"));
}

#[test]
fn invariant_first_import_in_a_layer_wins() {
    let harness = Harness::new(&svg(&[
        layer("Extra1", r#"<circle id="e1"/>"#),
        layer("Extra2", r#"<circle id="e2"/>"#),
        layer(
            "Talk",
            &[text(&["#import#", "Extra1"]), text(&["#import#", "Extra2"])].concat(),
        ),
    ]
    .concat()));

    let presentation = harness.resolve();
    let talk = presentation.iter().find(|s| s.section == "Talk").unwrap();
    assert!(talk.names().contains(&"Extra1"));
    assert!(!talk.names().contains(&"Extra2"));
}

#[test]
fn invariant_opacity_multiplier_applies_to_named_layer_only() {
    let harness = Harness::new(&svg(&[
        layer("SlideA", r#"<rect id="a"/>"#),
        layer("SlideB", r#"<rect id="b"/>"#),
        layer("Talk", &text(&["#import#", "SlideA*0.5", "SlideB"])),
    ]
    .concat()));

    let presentation = harness.resolve();
    let talk = presentation.iter().find(|s| s.section == "Talk").unwrap();
    assert_eq!(talk.opacity_of("SlideA"), Some(0.5));
    assert_eq!(talk.opacity_of("SlideB"), Some(1.0));
    assert_eq!(talk.opacity_of("Talk"), Some(1.0));

    harness.compile(false).unwrap();
    let pdf = fs::read_to_string(harness.output()).unwrap();
    assert!(pdf.contains(r#"inkscape:label="SlideA" style="display:inline;opacity:0.5""#));
}

#[test]
fn invariant_import_at_root_is_rejected() {
    let harness = Harness::new(&svg(&[
        text(&["#import#", "Talk"]),
        layer("Talk", r#"<rect/>"#),
    ]
    .concat()));

    let err = harness.compile(false).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidDirectiveScope { .. }));
    assert_eq!(harness.renders(), 0);
}

#[test]
fn invariant_malformed_document_is_rejected() {
    let harness = Harness::new(r#"<svg><g inkscape:groupmode="layer"></svg>"#);

    assert!(matches!(
        harness.compile(false),
        Err(PipelineError::DocumentParse(_))
    ));
    assert_eq!(harness.renders(), 0);
}
