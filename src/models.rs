//! Core data models shared across the engine, catalog, and API layers.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of a document in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Processing,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "processing" => Ok(DocumentStatus::Processing),
            "processed" => Ok(DocumentStatus::Processed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(Error::InconsistentState(format!(
                "unknown document status '{}'",
                other
            ))),
        }
    }
}

/// The contiguous slot range a document's chunk vectors occupy in the index.
///
/// `start_slot` is inclusive, `end_slot` exclusive; the wire format keeps the
/// original `start_index`/`end_index`/`file_path` key names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpan {
    #[serde(rename = "start_index")]
    pub start_slot: u64,
    #[serde(rename = "end_index")]
    pub end_slot: u64,
    pub file_path: String,
}

impl IndexSpan {
    pub fn len(&self) -> u64 {
        self.end_slot.saturating_sub(self.start_slot)
    }

    pub fn is_empty(&self) -> bool {
        self.end_slot <= self.start_slot
    }

    pub fn slots(&self) -> impl Iterator<Item = u64> {
        self.start_slot..self.end_slot
    }

    pub fn contains(&self, slot: u64) -> bool {
        slot >= self.start_slot && slot < self.end_slot
    }
}

/// A document row as stored in the SQLite catalog.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: String,
    pub user_id: i64,
    pub stored_name: String,
    pub original_name: String,
    pub display_name: Option<String>,
    pub uploaded_at: i64,
    pub status: DocumentStatus,
    pub chunk_count: i64,
    pub index_span: Option<IndexSpan>,
}

impl DocumentRecord {
    /// The name shown to callers: the display name when set, otherwise the
    /// original upload name.
    pub fn shown_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.original_name)
    }
}

/// One retrieved chunk with its blended relevance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f32,
}

/// The full outcome of a query, as cached and as returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub relevant_chunks: Vec<RetrievedChunk>,
    pub context: String,
    #[serde(default)]
    pub cached: bool,
}

/// Read-only diagnostic summary of index/mapping/catalog agreement.
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub index_len: u64,
    pub mapped_slots: u64,
    pub chunk_entries: u64,
    pub document_rows: u64,
    pub processed: u64,
    pub processing: u64,
    pub failed: u64,
    pub valid_documents: Vec<String>,
    pub invalid_documents: Vec<InvalidDocument>,
    pub orphaned_slots: u64,
    pub anomalies: Vec<String>,
    pub consistent: bool,
}

/// A catalog row whose span disagrees with the index or mappings.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidDocument {
    pub document_id: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            DocumentStatus::Processing,
            DocumentStatus::Processed,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(DocumentStatus::parse("archived").is_err());
    }

    #[test]
    fn span_wire_keys_are_preserved() {
        let span = IndexSpan {
            start_slot: 3,
            end_slot: 7,
            file_path: "uploads/1/a.pdf".to_string(),
        };
        let json = serde_json::to_value(&span).unwrap();
        assert_eq!(json["start_index"], 3);
        assert_eq!(json["end_index"], 7);
        assert_eq!(json["file_path"], "uploads/1/a.pdf");

        let back: IndexSpan = serde_json::from_value(json).unwrap();
        assert_eq!(back, span);
    }

    #[test]
    fn span_slot_iteration() {
        let span = IndexSpan {
            start_slot: 2,
            end_slot: 5,
            file_path: String::new(),
        };
        assert_eq!(span.len(), 3);
        assert!(span.contains(2));
        assert!(span.contains(4));
        assert!(!span.contains(5));
        assert_eq!(span.slots().collect::<Vec<_>>(), vec![2, 3, 4]);
    }
}
