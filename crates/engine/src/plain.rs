//! Reference engine: plain-text projects rendered to PDF.
//!
//! Small enough to run in tests and in the default `folio-worker` sandbox,
//! while still producing real, page-countable PDF artifacts.

use std::fs;
use std::path::Path;

use chrono::Utc;
use serde_json::Value as JsonValue;

use crate::compiler::{CompileError, CompileStats, CompiledDocument, DocumentCompiler, ProjectSource};
use crate::document::{DeviceProfile, Document};
use crate::renderer::{DocumentRenderer, RenderError, RenderOutput};

const PAGE_BREAK: char = '\u{000C}';
const SOURCE_EXTENSIONS: [&str; 2] = ["txt", "md"];

const MARGIN: u32 = 56;
const FONT_SIZE: u32 = 11;
const LEADING: u32 = 14;
const DETERMINISTIC_DATE: &str = "D:20000101000000Z";

/// Compiles a directory of `*.txt` / `*.md` files into a paged document.
///
/// Files are concatenated in name order; form-feed characters start a new
/// page. The first `# ` heading becomes the title.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextCompiler;

impl PlainTextCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentCompiler for PlainTextCompiler {
    fn compile(
        &self,
        project: &ProjectSource,
        _profile: &DeviceProfile,
    ) -> Result<CompiledDocument, CompileError> {
        let dir = &project.source_dir;
        if !dir.is_dir() {
            return Err(CompileError::InvalidProject(format!(
                "source directory {} does not exist",
                dir.display()
            )));
        }

        let mut files: Vec<_> = fs::read_dir(dir)
            .map_err(|e| CompileError::Io(format!("{}: {e}", dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_source_extension(path))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CompileError::InvalidProject(
                "project has no .txt or .md sources".to_string(),
            ));
        }

        let mut stats = CompileStats::default();
        let mut warnings = Vec::new();
        let mut text = String::new();
        let mut title = None;

        for path in &files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let raw = fs::read(path).map_err(|e| CompileError::Io(format!("{name}: {e}")))?;
            stats.source_bytes += raw.len() as u64;

            let content = match String::from_utf8(raw) {
                Ok(s) => s,
                Err(_) => {
                    warnings.push(format!("{name}: not valid UTF-8, skipped"));
                    continue;
                }
            };

            if content.contains("{{") && !content.contains("}}") {
                return Err(CompileError::Template {
                    file: name,
                    message: "unterminated '{{' placeholder".to_string(),
                });
            }

            if title.is_none() {
                title = content
                    .lines()
                    .find_map(|l| l.strip_prefix("# "))
                    .map(|t| t.trim().to_string());
            }

            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&content);
            stats.files += 1;
        }

        let pages: Vec<String> = text
            .split(PAGE_BREAK)
            .map(|p| p.trim_matches('\n').to_string())
            .filter(|p| {
                let keep = !p.trim().is_empty();
                if !keep {
                    warnings.push("empty page dropped".to_string());
                }
                keep
            })
            .collect();
        stats.pages = pages.len();

        let title = title.unwrap_or_else(|| format!("project {}", project.project_id));
        Ok(CompiledDocument {
            document: Document::from_pages(title, pages),
            stats,
            warnings,
        })
    }
}

fn has_source_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e))
}

/// Renders `{"title", "pages"}` documents into a minimal PDF 1.4 file with
/// one Helvetica text page per layout page.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfRenderer;

impl PdfRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentRenderer for PdfRenderer {
    fn render(
        &self,
        document: &Document,
        profile_name: &str,
        deterministic: bool,
        strict: bool,
    ) -> Result<RenderOutput, RenderError> {
        let profile: DeviceProfile = profile_name
            .parse()
            .map_err(|_| RenderError::UnknownProfile(profile_name.to_string()))?;

        let source_pages = document
            .as_json()
            .get("pages")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| RenderError::InvalidDocument("missing 'pages' array".to_string()))?;

        let mut warnings = Vec::new();
        let layout = Layout::for_profile(profile);
        let mut physical: Vec<Vec<String>> = Vec::new();

        for (idx, page) in source_pages.iter().enumerate() {
            let text = page.as_str().ok_or_else(|| {
                RenderError::InvalidDocument(format!("page {} is not a string", idx + 1))
            })?;
            let laid_out = layout.lay_out(idx + 1, text, &mut warnings);
            physical.extend(laid_out);
        }

        if physical.is_empty() {
            warnings.push("document has no pages; emitted a blank page".to_string());
            physical.push(Vec::new());
        }

        if strict {
            if let Some(first) = warnings.first() {
                return Err(RenderError::Strict(first.clone()));
            }
        }

        let title = document.title().unwrap_or("untitled");
        let created = if deterministic {
            DETERMINISTIC_DATE.to_string()
        } else {
            Utc::now().format("D:%Y%m%d%H%M%SZ").to_string()
        };

        Ok(RenderOutput {
            bytes: write_pdf(title, &created, profile, &physical),
            warnings,
        })
    }
}

struct Layout {
    max_columns: usize,
    max_lines: usize,
}

impl Layout {
    fn for_profile(profile: DeviceProfile) -> Self {
        let (width, height) = profile.page_size();
        // Helvetica averages roughly half an em per glyph.
        let max_columns = ((width - 2 * MARGIN) * 2 / FONT_SIZE) as usize;
        let max_lines = ((height - 2 * MARGIN) / LEADING) as usize;
        Self {
            max_columns,
            max_lines,
        }
    }

    fn lay_out(&self, page_no: usize, text: &str, warnings: &mut Vec<String>) -> Vec<Vec<String>> {
        let mut replaced = 0usize;
        let mut wrapped = 0usize;
        let mut lines = Vec::new();

        for raw in text.lines() {
            let ascii: String = raw
                .chars()
                .map(|c| {
                    if c.is_ascii() && !c.is_ascii_control() {
                        c
                    } else if c == '\t' {
                        ' '
                    } else {
                        replaced += 1;
                        '?'
                    }
                })
                .collect();

            if ascii.len() <= self.max_columns {
                lines.push(ascii);
                continue;
            }
            wrapped += 1;
            let bytes = ascii.as_bytes();
            for chunk in bytes.chunks(self.max_columns) {
                lines.push(String::from_utf8_lossy(chunk).into_owned());
            }
        }

        if replaced > 0 {
            warnings.push(format!(
                "page {page_no}: replaced {replaced} unsupported characters"
            ));
        }
        if wrapped > 0 {
            warnings.push(format!("page {page_no}: wrapped {wrapped} overlong lines"));
        }

        let mut pages: Vec<Vec<String>> = lines
            .chunks(self.max_lines)
            .map(<[String]>::to_vec)
            .collect();
        if pages.is_empty() {
            pages.push(Vec::new());
        }
        if pages.len() > 1 {
            warnings.push(format!(
                "page {page_no}: overflowed onto {} pages",
                pages.len()
            ));
        }
        pages
    }
}

fn escape_pdf_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn write_pdf(title: &str, created: &str, profile: DeviceProfile, pages: &[Vec<String>]) -> Vec<u8> {
    let (width, height) = profile.page_size();

    // Fixed objects: 1 catalog, 2 page tree, 3 font, 4 info; then a
    // (page, content) pair per page.
    let page_obj = |i: usize| 5 + 2 * i;
    let kids: Vec<String> = (0..pages.len()).map(|i| format!("{} 0 R", page_obj(i))).collect();

    let mut objects: Vec<Vec<u8>> = vec![
        b"<< /Type /Catalog /Pages 2 0 R >>".to_vec(),
        format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids.join(" "),
            pages.len()
        )
        .into_bytes(),
        b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_vec(),
        format!(
            "<< /Title ({}) /Producer (folio) /CreationDate ({created}) >>",
            escape_pdf_text(title)
        )
        .into_bytes(),
    ];

    for (i, lines) in pages.iter().enumerate() {
        let mut content = format!(
            "BT /F1 {FONT_SIZE} Tf {LEADING} TL {MARGIN} {} Td\n",
            height - MARGIN
        );
        for line in lines {
            content.push_str(&format!("({}) Tj T*\n", escape_pdf_text(line)));
        }
        content.push_str("ET");

        objects.push(
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {width} {height}] \
                 /Resources << /Font << /F1 3 0 R >> >> /Contents {} 0 R >>",
                page_obj(i) + 1
            )
            .into_bytes(),
        );
        objects.push(
            format!(
                "<< /Length {} >>\nstream\n{content}\nendstream",
                content.len()
            )
            .into_bytes(),
        );
    }

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n", i + 1).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\nendobj\n");
    }

    let xref_at = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for off in offsets {
        out.extend_from_slice(format!("{off:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R /Info 4 0 R >>\nstartxref\n{xref_at}\n%%EOF\n",
            objects.len() + 1
        )
        .as_bytes(),
    );
    out
}
