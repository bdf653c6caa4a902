//! Crate-wide error type.
//!
//! Engine operations return [`Error`]; the CLI and server map variants onto
//! exit codes and HTTP statuses respectively. Validation failures
//! (unsupported format, oversize, bad dimensions) are distinguished from
//! engine faults (index I/O, inconsistent state) so callers can tell a bad
//! request from a broken store.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File extension is not one of the supported document formats.
    #[error("unsupported format: '{0}'")]
    UnsupportedFormat(String),

    /// The document parsed but yielded no usable text, or the parser failed.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// Upload payload exceeds the configured size limit.
    #[error("upload of {size} bytes exceeds limit of {limit} bytes")]
    OversizedUpload { size: u64, limit: u64 },

    /// An embedding vector's length does not match the index dimensionality.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// A query arrived while the index holds no retrievable chunks.
    #[error("knowledge base is empty")]
    EmptyKnowledgeBase,

    /// The embedding provider failed for a batch.
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    /// Reading or writing an index/mapping artifact failed or the artifact
    /// is corrupt.
    #[error("index I/O failed at {path}: {detail}")]
    IndexIo { path: PathBuf, detail: String },

    /// The index, mappings, and catalog disagree in a way that cannot be
    /// resolved without repair.
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    /// No document with the given id visible to the caller.
    #[error("document not found: {0}")]
    NotFound(String),

    /// The caller does not own the document and is not an admin.
    #[error("forbidden")]
    Forbidden,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn index_io(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Error::IndexIo {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Whether this error is a caller mistake rather than an engine fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedFormat(_)
                | Error::ExtractionFailed(_)
                | Error::OversizedUpload { .. }
                | Error::EmptyKnowledgeBase
                | Error::NotFound(_)
                | Error::Forbidden
        )
    }
}
