//! Upload lifecycle: preparation and compensation.
//!
//! [`prepare`] runs the CPU-bound half of an upload (format resolution,
//! extraction, chunking) with no side effects, so the engine can embed and
//! index the result under its own locking discipline. [`Compensation`]
//! records the inverse of each side-effecting step the engine has taken;
//! on failure the engine replays the list in reverse. Vectors already
//! appended to the index have no inverse: without a mapping entry they are
//! unreachable, and the consistency report counts them as orphaned slots.

use std::path::{Path, PathBuf};

use crate::chunker;
use crate::config::ChunkingConfig;
use crate::error::{Error, Result};
use crate::extract::{self, DocumentFormat};

/// Extracted and chunked document content, ready for embedding.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub format: DocumentFormat,
    pub text: String,
    pub chunks: Vec<String>,
}

/// Resolves the format, extracts text, and chunks it.
pub fn prepare(path: &Path, bytes: &[u8], chunking: &ChunkingConfig) -> Result<PreparedDocument> {
    let format = DocumentFormat::from_path(path)?;
    let text = extract::extract_text(format, bytes)?;
    let chunks = chunker::split(&text, chunking);
    if chunks.is_empty() {
        return Err(Error::ExtractionFailed(
            "document produced no chunks".to_string(),
        ));
    }
    Ok(PreparedDocument {
        format,
        text,
        chunks,
    })
}

/// Lowercased extension of an upload name, already validated by
/// [`DocumentFormat::from_path`].
pub fn file_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Inverse of one completed upload step.
#[derive(Debug, Clone)]
pub enum Compensation {
    RemoveStoredFile(PathBuf),
    MarkRowFailed(String),
    UnmapDocument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_text_document() {
        let prepared = prepare(
            Path::new("notes.txt"),
            b"First paragraph.\n\nSecond paragraph.",
            &ChunkingConfig::default(),
        )
        .unwrap();
        assert_eq!(prepared.format, DocumentFormat::Text);
        assert!(!prepared.chunks.is_empty());
        assert!(prepared.text.contains("First paragraph."));
    }

    #[test]
    fn prepare_rejects_unknown_extension() {
        let err = prepare(Path::new("photo.png"), b"...", &ChunkingConfig::default()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn prepare_rejects_empty_document() {
        let err = prepare(Path::new("empty.txt"), b"   \n\n  ", &ChunkingConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::ExtractionFailed(_)));
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(file_extension("Report.PDF"), "pdf");
        assert_eq!(file_extension("notes.md"), "md");
        assert_eq!(file_extension("no_extension"), "");
    }
}
