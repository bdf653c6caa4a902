//! Per-format text extraction and normalization.
//!
//! Uploads are routed through [`DocumentFormat`], a closed set of supported
//! formats resolved from the file extension. Each extractor returns plain
//! UTF-8 text with `\n\n` paragraph breaks; [`normalize_text`] then collapses
//! whitespace and drops repeated paragraphs so downstream chunking sees
//! clean input.

use std::io::Read;
use std::path::Path;

use pulldown_cmark::{Event, Parser, TagEnd};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Decompressed-size cap for a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// The closed set of supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Text,
    Markdown,
    Pdf,
    Docx,
}

impl DocumentFormat {
    /// Resolves the format from a file name's extension. Unknown or missing
    /// extensions are rejected up front, before any bytes are stored.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "txt" => Ok(DocumentFormat::Text),
            "md" | "markdown" => Ok(DocumentFormat::Markdown),
            "pdf" => Ok(DocumentFormat::Pdf),
            "docx" => Ok(DocumentFormat::Docx),
            _ => Err(Error::UnsupportedFormat(path.display().to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Text => "text",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
        }
    }
}

/// Extracts normalized text from raw document bytes.
///
/// Returns `ExtractionFailed` when the parser rejects the bytes or when the
/// document yields no text after normalization.
pub fn extract_text(format: DocumentFormat, bytes: &[u8]) -> Result<String> {
    let raw = match format {
        DocumentFormat::Text => decode_utf8(bytes)?,
        DocumentFormat::Markdown => flatten_markdown(&decode_utf8(bytes)?),
        DocumentFormat::Pdf => extract_pdf(bytes)?,
        DocumentFormat::Docx => extract_docx(bytes)?,
    };

    let normalized = normalize_text(&raw);
    if normalized.is_empty() {
        return Err(Error::ExtractionFailed(
            "document contains no extractable text".to_string(),
        ));
    }
    Ok(normalized)
}

fn decode_utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::ExtractionFailed(format!("invalid UTF-8: {}", e)))
}

// ============ Markdown ============

/// Flattens Markdown to plain text, keeping paragraph structure and dropping
/// formatting, links, and image references.
fn flatten_markdown(text: &str) -> String {
    let mut out = String::new();
    for event in Parser::new(text) {
        match event {
            Event::Text(t) | Event::Code(t) => out.push_str(&t),
            Event::SoftBreak | Event::HardBreak => out.push(' '),
            Event::End(
                TagEnd::Paragraph
                | TagEnd::Heading(_)
                | TagEnd::Item
                | TagEnd::CodeBlock
                | TagEnd::BlockQuote(_)
                | TagEnd::TableRow,
            ) => out.push_str("\n\n"),
            Event::End(TagEnd::TableCell) => out.push(' '),
            _ => {}
        }
    }
    out
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| Error::ExtractionFailed(format!("PDF: {}", e)))
}

// ============ DOCX ============

/// Extracts a DOCX by walking `w:t` runs in the main document plus headers
/// and footers. Paragraph ends become blank lines so chunking can split on
/// them later.
fn extract_docx(bytes: &[u8]) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| Error::ExtractionFailed(format!("DOCX: {}", e)))?;

    let mut parts: Vec<String> = Vec::new();
    parts.extend(numbered_entries(&archive, "word/header"));
    if archive
        .file_names()
        .any(|n| n == "word/document.xml")
    {
        parts.push("word/document.xml".to_string());
    } else {
        return Err(Error::ExtractionFailed(
            "DOCX: word/document.xml not found".to_string(),
        ));
    }
    parts.extend(numbered_entries(&archive, "word/footer"));

    let mut out = String::new();
    for name in parts {
        let xml = read_zip_entry(&mut archive, &name)?;
        let text = collect_text_runs(&xml)?;
        if !text.is_empty() {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&text);
        }
    }
    Ok(out)
}

/// Lists `<prefix>N.xml` entries sorted by N.
fn numbered_entries(
    archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>,
    prefix: &str,
) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn read_zip_entry(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| Error::ExtractionFailed(format!("DOCX: {}", e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| Error::ExtractionFailed(format!("DOCX: {}", e)))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(Error::ExtractionFailed(format!(
            "DOCX: entry {} exceeds size limit",
            name
        )));
    }
    Ok(out)
}

/// Collects `w:t` text runs in document order, inserting blank lines at
/// paragraph boundaries (`w:p`).
fn collect_text_runs(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if in_text => {
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !out.ends_with("\n\n") && !out.is_empty() {
                        out.push_str("\n\n");
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(Error::ExtractionFailed(format!("DOCX XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim().to_string())
}

// ============ Normalization ============

/// Collapses whitespace runs within paragraphs and drops exact duplicate
/// paragraphs, keeping first occurrences. Order is preserved.
pub fn normalize_text(raw: &str) -> String {
    let mut seen: std::collections::HashSet<[u8; 32]> = std::collections::HashSet::new();
    let mut paragraphs: Vec<String> = Vec::new();

    for para in raw.split("\n\n") {
        let collapsed = para.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            continue;
        }
        let digest: [u8; 32] = Sha256::digest(collapsed.as_bytes()).into();
        if seen.insert(digest) {
            paragraphs.push(collapsed);
        }
    }

    paragraphs.join("\n\n")
}
