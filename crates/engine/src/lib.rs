//! Rendering collaborators: the compile and render boundaries the job
//! pipeline drives inside its sandbox.
//!
//! The pipeline stays engine-agnostic: it only sees [`DocumentCompiler`] and
//! [`DocumentRenderer`]. [`plain`] provides a small reference engine
//! (plain-text projects rendered to PDF) used by the `folio-worker` binary.

pub mod compiler;
pub mod document;
pub mod pages;
pub mod plain;
pub mod renderer;

pub use compiler::{CompileError, CompileStats, CompiledDocument, DocumentCompiler, ProjectSource};
pub use document::{DeviceProfile, Document, RenderOptions};
pub use pages::count_pages;
pub use plain::{PdfRenderer, PlainTextCompiler};
pub use renderer::{DocumentRenderer, RenderError, RenderOutput};
