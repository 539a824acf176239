//! The two-phase compile + render pipeline run inside the sandbox child.

use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde_json::json;

use folio_engine::{
    count_pages, DeviceProfile, Document, DocumentCompiler, DocumentRenderer, RenderOptions,
};

use super::{FailureKind, SandboxSource};
use crate::jobs::{Diagnostics, PhaseDiagnostics};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    pub bytes: Vec<u8>,
    pub page_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFailure {
    pub kind: FailureKind,
    pub error: String,
}

impl PipelineFailure {
    fn new(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            error: error.into(),
        }
    }
}

/// Run compile then render, recording each phase in `diagnostics` as it goes.
///
/// `diagnostics` is shared with the child's watchdog, which snapshots it if
/// the wall-clock budget runs out mid-phase. Compile diagnostics are
/// finalized before the render phase starts.
pub fn run_pipeline(
    source: &SandboxSource,
    options: &RenderOptions,
    compiler: &dyn DocumentCompiler,
    renderer: &dyn DocumentRenderer,
    diagnostics: &Mutex<Diagnostics>,
) -> Result<RenderedArtifact, PipelineFailure> {
    let document = compile_phase(source, options, compiler, diagnostics)?;
    render_phase(&document, options, renderer, diagnostics)
}

fn compile_phase(
    source: &SandboxSource,
    options: &RenderOptions,
    compiler: &dyn DocumentCompiler,
    diagnostics: &Mutex<Diagnostics>,
) -> Result<Document, PipelineFailure> {
    let project = match source {
        SandboxSource::Inline { document } => {
            record(diagnostics, |d| {
                d.compile = PhaseDiagnostics::skipped(Utc::now(), json!({ "source": "inline" }));
            });
            return Ok(document.clone());
        }
        SandboxSource::Project(project) => project,
    };

    record(diagnostics, |d| d.compile.start(Utc::now()));

    let compiled = options
        .profile
        .parse::<DeviceProfile>()
        .map_err(|e| e.to_string())
        .and_then(|profile| compiler.compile(project, &profile).map_err(|e| e.to_string()));

    match compiled {
        Ok(compiled) => {
            let stats = json!({
                "files": compiled.stats.files,
                "source_bytes": compiled.stats.source_bytes,
                "pages": compiled.stats.pages,
            });
            record(diagnostics, |d| {
                d.compile.succeed(Utc::now(), stats, compiled.warnings.clone())
            });
            Ok(compiled.document)
        }
        Err(error) => {
            record(diagnostics, |d| d.compile.fail(Utc::now(), error.clone()));
            Err(PipelineFailure::new(FailureKind::Compile, error))
        }
    }
}

fn render_phase(
    document: &Document,
    options: &RenderOptions,
    renderer: &dyn DocumentRenderer,
    diagnostics: &Mutex<Diagnostics>,
) -> Result<RenderedArtifact, PipelineFailure> {
    record(diagnostics, |d| d.render.start(Utc::now()));

    match renderer.render(document, &options.profile, options.deterministic, options.strict) {
        Ok(output) => {
            // Never report zero pages for a successful render.
            let page_count = count_pages(&output.bytes).unwrap_or(1).max(1);
            let stats = json!({
                "page_count": page_count,
                "size_bytes": output.bytes.len(),
                "profile": options.profile,
            });
            record(diagnostics, |d| {
                d.render.succeed(Utc::now(), stats, output.warnings.clone())
            });
            Ok(RenderedArtifact {
                bytes: output.bytes,
                page_count,
            })
        }
        Err(e) => {
            let error = e.to_string();
            record(diagnostics, |d| d.render.fail(Utc::now(), error.clone()));
            Err(PipelineFailure::new(FailureKind::Render, error))
        }
    }
}

pub(crate) fn record(diagnostics: &Mutex<Diagnostics>, f: impl FnOnce(&mut Diagnostics)) {
    let mut guard = diagnostics.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{OwnerId, ProjectId};
    use folio_engine::{
        CompileError, CompiledDocument, PdfRenderer, PlainTextCompiler, ProjectSource,
        RenderError, RenderOutput,
    };

    struct FailingCompiler;

    impl DocumentCompiler for FailingCompiler {
        fn compile(
            &self,
            _project: &ProjectSource,
            _profile: &DeviceProfile,
        ) -> Result<CompiledDocument, CompileError> {
            Err(CompileError::Template {
                file: "main.md".into(),
                message: "bad placeholder".into(),
            })
        }
    }

    struct PanicRenderer;

    impl DocumentRenderer for PanicRenderer {
        fn render(&self, _: &Document, _: &str, _: bool, _: bool) -> Result<RenderOutput, RenderError> {
            panic!("render must not run after a compile failure");
        }
    }

    /// Renders bytes that carry no page markers.
    struct OpaqueRenderer;

    impl DocumentRenderer for OpaqueRenderer {
        fn render(&self, _: &Document, _: &str, _: bool, _: bool) -> Result<RenderOutput, RenderError> {
            Ok(RenderOutput {
                bytes: b"opaque".to_vec(),
                warnings: vec!["approximate layout".into()],
            })
        }
    }

    fn project_source(dir: &std::path::Path) -> SandboxSource {
        SandboxSource::Project(ProjectSource {
            owner_id: OwnerId::new(),
            project_id: ProjectId::new(),
            source_dir: dir.to_path_buf(),
        })
    }

    #[test]
    fn inline_documents_skip_compilation() {
        let diagnostics = Mutex::new(Diagnostics::default());
        let source = SandboxSource::Inline {
            document: Document::from_pages("t", vec!["a".into(), "b".into()]),
        };
        let artifact = run_pipeline(
            &source,
            &RenderOptions::default(),
            &PlainTextCompiler,
            &PdfRenderer,
            &diagnostics,
        )
        .unwrap();

        assert_eq!(artifact.page_count, 2);
        let d = diagnostics.into_inner().unwrap();
        assert_eq!(d.compile.started_at, d.compile.completed_at);
        assert!(d.compile.started_at.unwrap() <= d.render.started_at.unwrap());
        assert!(d.render.completed_at.is_some());
    }

    #[test]
    fn compile_failure_short_circuits_render() {
        let dir = tempfile::tempdir().unwrap();
        let diagnostics = Mutex::new(Diagnostics::default());
        let failure = run_pipeline(
            &project_source(dir.path()),
            &RenderOptions::default(),
            &FailingCompiler,
            &PanicRenderer,
            &diagnostics,
        )
        .unwrap_err();

        assert_eq!(failure.kind, FailureKind::Compile);
        assert!(failure.error.contains("main.md"));
        let d = diagnostics.into_inner().unwrap();
        assert!(d.compile.error.is_some());
        assert!(d.render.started_at.is_none());
    }

    #[test]
    fn unknown_profile_fails_the_compile_phase() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let options = RenderOptions {
            profile: "tabloid".into(),
            ..RenderOptions::default()
        };
        let failure = run_pipeline(
            &project_source(dir.path()),
            &options,
            &PlainTextCompiler,
            &PdfRenderer,
            &Mutex::new(Diagnostics::default()),
        )
        .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Compile);
    }

    #[test]
    fn render_errors_are_classified_as_render() {
        let options = RenderOptions {
            strict: true,
            ..RenderOptions::default()
        };
        let source = SandboxSource::Inline {
            document: Document::from_pages("t", vec!["caf\u{e9}".into()]),
        };
        let failure = run_pipeline(
            &source,
            &options,
            &PlainTextCompiler,
            &PdfRenderer,
            &Mutex::new(Diagnostics::default()),
        )
        .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Render);
    }

    #[test]
    fn page_count_defaults_to_one_and_warnings_accumulate() {
        let diagnostics = Mutex::new(Diagnostics::default());
        let source = SandboxSource::Inline {
            document: Document::from_pages("t", vec![]),
        };
        let artifact = run_pipeline(
            &source,
            &RenderOptions::default(),
            &PlainTextCompiler,
            &OpaqueRenderer,
            &diagnostics,
        )
        .unwrap();
        assert_eq!(artifact.page_count, 1);
        assert_eq!(
            diagnostics.into_inner().unwrap().render.warnings,
            vec!["approximate layout".to_string()]
        );
    }

    #[test]
    fn project_sources_compile_and_render() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "# Title\none\u{000C}two\u{000C}three").unwrap();
        let diagnostics = Mutex::new(Diagnostics::default());
        let artifact = run_pipeline(
            &project_source(dir.path()),
            &RenderOptions::default(),
            &PlainTextCompiler,
            &PdfRenderer,
            &diagnostics,
        )
        .unwrap();
        assert_eq!(artifact.page_count, 3);
        let d = diagnostics.into_inner().unwrap();
        assert_eq!(d.compile.stats["files"], 1);
        assert!(d.compile.completed_at.unwrap() <= d.render.started_at.unwrap());
    }
}
