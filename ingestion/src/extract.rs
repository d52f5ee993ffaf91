use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Markdown,
    Json,
    Pdf,
    Docx,
    Epub,
    Jupyter,
    Unsupported,
}

pub fn detect_content_kind(mime_type: &str, filename: Option<&str>) -> ContentKind {
    let mime = mime_type.split(';').next().unwrap_or("").trim().to_lowercase();
    match mime.as_str() {
        "text/plain" => ContentKind::Text,
        "text/markdown" => ContentKind::Markdown,
        "application/json" => ContentKind::Json,
        "application/pdf" => ContentKind::Pdf,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ContentKind::Docx,
        "application/epub+zip" => ContentKind::Epub,
        "application/x-ipynb+json" => ContentKind::Jupyter,
        _ => {
            if let Some(name) = filename {
                let ext = Path::new(name)
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("")
                    .to_lowercase();
                match ext.as_str() {
                    "txt" => ContentKind::Text,
                    "md" | "markdown" => ContentKind::Markdown,
                    "json" => ContentKind::Json,
                    "pdf" => ContentKind::Pdf,
                    "docx" => ContentKind::Docx,
                    "epub" => ContentKind::Epub,
                    "ipynb" => ContentKind::Jupyter,
                    _ => ContentKind::Unsupported,
                }
            } else {
                ContentKind::Unsupported
            }
        }
    }
}

pub fn extract_utf8(bytes: &[u8]) -> Result<String, std::string::FromUtf8Error> {
    String::from_utf8(bytes.to_vec())
}

pub fn extract_pdf_text(bytes: &[u8]) -> Option<String> {
    match pdf_extract::extract_text_from_mem(bytes) {
        Ok(text) => {
            if text.trim().is_empty() {
                None
            } else {
                Some(text)
            }
        }
        Err(_) => None,
    }
}

pub fn extract_docx_text(bytes: &[u8]) -> Option<String> {
    let document = docx_rs::read_docx(bytes).ok()?;
    let mut text = String::new();
    for child in &document.document.children {
        collect_docx_text(child, &mut text);
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn collect_docx_text(child: &docx_rs::DocumentChild, out: &mut String) {
    if let docx_rs::DocumentChild::Paragraph(paragraph) = child {
        for run_child in &paragraph.children {
            if let docx_rs::ParagraphChild::Run(run) = run_child {
                for text_child in &run.children {
                    if let docx_rs::RunChild::Text(t) = text_child {
                        out.push_str(&t.text);
                    }
                }
            }
        }
        out.push('\n');
    }
}

/// `epub`'s reader needs a seekable file, so the bytes are spilled to a
/// scratch file under the system temp dir for the duration of the read.
pub fn extract_epub_text(bytes: &[u8]) -> Option<String> {
    let mut scratch = tempfile::Builder::new().suffix(".epub").tempfile().ok()?;
    scratch.write_all(bytes).ok()?;
    scratch.flush().ok()?;

    let mut doc = epub::doc::EpubDoc::new(scratch.path()).ok()?;
    let mut text = String::new();
    loop {
        if let Some((content, _mime)) = doc.get_current_str() {
            let stripped = strip_html_tags(&content);
            if !stripped.trim().is_empty() {
                text.push_str(stripped.trim());
                text.push_str("\n\n");
            }
        }
        if !doc.go_next() {
            break;
        }
    }

    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// One extracted Jupyter cell, tagged with its source language so the
/// chunker can route it to the matching AST grammar (code) or the markdown
/// splitter (markdown/raw).
#[derive(Debug, Clone)]
pub struct JupyterCell {
    pub cell_type: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct JupyterNotebook {
    pub kernel_language: Option<String>,
    pub cells: Vec<JupyterCell>,
}

/// `.ipynb` is plain JSON with a documented schema, so this walks the
/// `serde_json::Value` tree directly rather than pulling in a notebook crate.
pub fn extract_jupyter_notebook(bytes: &[u8]) -> Option<JupyterNotebook> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;

    let kernel_language = value
        .get("metadata")
        .and_then(|m| m.get("kernelspec"))
        .and_then(|k| k.get("language"))
        .and_then(|l| l.as_str())
        .map(str::to_string)
        .or_else(|| {
            value
                .get("metadata")
                .and_then(|m| m.get("language_info"))
                .and_then(|l| l.get("name"))
                .and_then(|n| n.as_str())
                .map(str::to_string)
        });

    let cells = value.get("cells")?.as_array()?.iter().filter_map(|cell| {
        let cell_type = cell.get("cell_type")?.as_str()?.to_string();
        let source = join_source(cell.get("source")?);
        if source.trim().is_empty() {
            None
        } else {
            Some(JupyterCell { cell_type, source })
        }
    }).collect();

    Some(JupyterNotebook {
        kernel_language,
        cells,
    })
}

fn join_source(source: &serde_json::Value) -> String {
    match source {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(lines) => lines
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

impl JupyterNotebook {
    /// Concatenates cells for callers that just need flat text (e.g. the
    /// FTS index or a semantic-only chunking path); merges adjacent cells
    /// of the same type into one block, matching the extractor's merge
    /// contract.
    pub fn merged_text(&self) -> String {
        let mut out = String::new();
        let mut last_kind: Option<&str> = None;
        for cell in &self.cells {
            if last_kind != Some(cell.cell_type.as_str()) {
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                last_kind = Some(cell.cell_type.as_str());
            } else {
                out.push('\n');
            }
            out.push_str(&cell.source);
        }
        out
    }
}

/// Extraction step that may be retried once through an externally supplied
/// repair hook before giving up. PDF/EPUB extraction in the original system
/// shells out to Ghostscript/pandoc/xelatex/headless-Chromium on failure;
/// those tool chains are out of scope here, so `repair` is a pluggable
/// no-op by default and callers can supply their own command wrapper.
pub trait RepairableExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Option<String>;

    /// Attempts a one-shot repair of `bytes`, returning repaired bytes to
    /// retry extraction with. Returns `None` when no repair is available.
    fn repair(&self, bytes: &[u8]) -> Option<Vec<u8>>;

    fn extract_with_repair(&self, bytes: &[u8]) -> Option<String> {
        self.extract(bytes).or_else(|| {
            let repaired = self.repair(bytes)?;
            self.extract(&repaired)
        })
    }
}

pub struct PdfExtractor;

impl RepairableExtractor for PdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Option<String> {
        extract_pdf_text(bytes)
    }

    /// No built-in Ghostscript invocation; a deployment that wants the
    /// repair pass wires its own command in place of this no-op.
    fn repair(&self, _bytes: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

pub struct EpubExtractor;

impl RepairableExtractor for EpubExtractor {
    fn extract(&self, bytes: &[u8]) -> Option<String> {
        extract_epub_text(bytes)
    }

    fn repair(&self, _bytes: &[u8]) -> Option<Vec<u8>> {
        None
    }
}
