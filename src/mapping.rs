//! Slot mapping store.
//!
//! Ties index slots back to documents and chunk text. Three maps are kept
//! in lockstep:
//!
//! - slot → document id
//! - document id → slot span
//! - slot → chunk text
//!
//! The consistency law: every document span is fully covered by the slot
//! and chunk maps, no slot entry falls outside its owner's span, and the
//! index is at least as long as the highest mapped slot. Slots below the
//! index length with no mapping are holes left by deletions or failed
//! uploads; they are legal and simply unreachable.
//!
//! Persisted as two JSON artifacts, `mapping.json` and `chunks.json`,
//! written atomically (temp file + rename). The mapping file keeps its
//! historical key names so existing deployments can be read back.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::{Error, Result};
use crate::models::{DocumentRecord, DocumentStatus, IndexSpan, InvalidDocument};

pub const MAPPING_FILE: &str = "mapping.json";
pub const CHUNKS_FILE: &str = "chunks.json";

#[derive(Debug, Clone, Default)]
pub struct MappingStore {
    slot_to_doc: BTreeMap<u64, String>,
    doc_spans: HashMap<String, (u64, u64)>,
    slot_to_chunk: BTreeMap<u64, String>,
}

/// Outcome of a structural repair pass.
#[derive(Debug, Clone)]
pub struct RepairSummary {
    pub kept: Vec<String>,
    pub dropped: Vec<InvalidDocument>,
    pub chunks_discarded: u64,
}

#[derive(Serialize, Deserialize)]
struct MappingFile {
    vector_index_to_doc_id: BTreeMap<u64, String>,
    doc_id_to_vector_indices: BTreeMap<String, (u64, u64)>,
}

impl MappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mapped_slot_count(&self) -> u64 {
        self.slot_to_doc.len() as u64
    }

    pub fn chunk_entry_count(&self) -> u64 {
        self.slot_to_chunk.len() as u64
    }

    pub fn has_chunks(&self) -> bool {
        !self.slot_to_chunk.is_empty()
    }

    pub fn document_span(&self, doc_id: &str) -> Option<(u64, u64)> {
        self.doc_spans.get(doc_id).copied()
    }

    pub fn document_for_slot(&self, slot: u64) -> Option<&str> {
        self.slot_to_doc.get(&slot).map(String::as_str)
    }

    pub fn chunk_for_slot(&self, slot: u64) -> Option<&str> {
        self.slot_to_chunk.get(&slot).map(String::as_str)
    }

    pub fn max_mapped_slot(&self) -> Option<u64> {
        self.slot_to_doc.keys().next_back().copied()
    }

    /// Records a document's span and chunk texts. `chunks` must line up
    /// one-to-one with the span's slots.
    pub fn insert_document(&mut self, doc_id: &str, span: &IndexSpan, chunks: &[String]) {
        debug_assert_eq!(span.len() as usize, chunks.len());
        self.doc_spans
            .insert(doc_id.to_string(), (span.start_slot, span.end_slot));
        for (slot, chunk) in span.slots().zip(chunks.iter()) {
            self.slot_to_doc.insert(slot, doc_id.to_string());
            self.slot_to_chunk.insert(slot, chunk.clone());
        }
    }

    /// Removes a document's span and all slots it covered, leaving holes.
    pub fn remove_document(&mut self, doc_id: &str) -> Option<(u64, u64)> {
        let (start, end) = self.doc_spans.remove(doc_id)?;
        for slot in start..end {
            self.slot_to_doc.remove(&slot);
            self.slot_to_chunk.remove(&slot);
        }
        Some((start, end))
    }

    pub fn clear(&mut self) {
        self.slot_to_doc.clear();
        self.doc_spans.clear();
        self.slot_to_chunk.clear();
    }

    // ============ Verification ============

    /// Checks the consistency law against an index of `index_len` slots.
    pub fn verify(&self, index_len: u64) -> bool {
        self.anomalies(index_len).is_empty()
    }

    /// All law violations, as human-readable descriptions.
    pub fn anomalies(&self, index_len: u64) -> Vec<String> {
        let mut out = Vec::new();

        for (doc_id, &(start, end)) in &self.doc_spans {
            if start >= end {
                out.push(format!("document {} has empty span [{}, {})", doc_id, start, end));
                continue;
            }
            if end > index_len {
                out.push(format!(
                    "document {} span reaches slot {} but index has {} slots",
                    doc_id,
                    end - 1,
                    index_len
                ));
            }
            for slot in start..end {
                match self.slot_to_doc.get(&slot) {
                    Some(owner) if owner == doc_id => {}
                    Some(owner) => out.push(format!(
                        "slot {} inside span of {} is mapped to {}",
                        slot, doc_id, owner
                    )),
                    None => out.push(format!(
                        "slot {} inside span of {} is unmapped",
                        slot, doc_id
                    )),
                }
                if !self.slot_to_chunk.contains_key(&slot) {
                    out.push(format!(
                        "slot {} of document {} has no chunk text",
                        slot, doc_id
                    ));
                }
            }
        }

        for (&slot, doc_id) in &self.slot_to_doc {
            match self.doc_spans.get(doc_id) {
                Some(&(start, end)) if slot >= start && slot < end => {}
                Some(_) => out.push(format!(
                    "slot {} maps to {} but lies outside its span",
                    slot, doc_id
                )),
                None => out.push(format!(
                    "slot {} maps to unknown document {}",
                    slot, doc_id
                )),
            }
        }

        for &slot in self.slot_to_chunk.keys() {
            if !self.slot_to_doc.contains_key(&slot) {
                out.push(format!("chunk text at slot {} belongs to no document", slot));
            }
        }

        out
    }

    // ============ Structural repair ============

    /// Rebuilds the slot and span maps from catalog rows, keeping only rows
    /// whose recorded span is internally consistent with the index length
    /// and the surviving chunk texts. Never re-embeds; rows that cannot be
    /// salvaged are reported so the caller can mark them failed.
    pub fn repair(&mut self, catalog: &[DocumentRecord], index_len: u64) -> RepairSummary {
        let mut kept = Vec::new();
        let mut dropped = Vec::new();

        let mut rows: Vec<&DocumentRecord> = catalog
            .iter()
            .filter(|r| r.status == DocumentStatus::Processed)
            .collect();
        rows.sort_by_key(|r| {
            (
                r.index_span.as_ref().map(|s| s.start_slot).unwrap_or(u64::MAX),
                r.id.clone(),
            )
        });

        let mut new_slot_to_doc: BTreeMap<u64, String> = BTreeMap::new();
        let mut new_spans: HashMap<String, (u64, u64)> = HashMap::new();

        for row in rows {
            let span = match &row.index_span {
                Some(span) => span,
                None => {
                    dropped.push(InvalidDocument {
                        document_id: row.id.clone(),
                        reason: "processed row has no recorded span".to_string(),
                    });
                    continue;
                }
            };

            let reason = if span.is_empty() {
                Some("empty span".to_string())
            } else if span.end_slot > index_len {
                Some(format!(
                    "span ends at slot {} but index has {} slots",
                    span.end_slot - 1,
                    index_len
                ))
            } else if span.slots().any(|s| new_slot_to_doc.contains_key(&s)) {
                Some("span overlaps an earlier document".to_string())
            } else if span.slots().any(|s| !self.slot_to_chunk.contains_key(&s)) {
                Some("span slots are missing chunk text".to_string())
            } else {
                None
            };

            match reason {
                Some(reason) => dropped.push(InvalidDocument {
                    document_id: row.id.clone(),
                    reason,
                }),
                None => {
                    for slot in span.slots() {
                        new_slot_to_doc.insert(slot, row.id.clone());
                    }
                    new_spans.insert(row.id.clone(), (span.start_slot, span.end_slot));
                    kept.push(row.id.clone());
                }
            }
        }

        let before = self.slot_to_chunk.len() as u64;
        self.slot_to_chunk
            .retain(|slot, _| new_slot_to_doc.contains_key(slot));
        let chunks_discarded = before - self.slot_to_chunk.len() as u64;

        self.slot_to_doc = new_slot_to_doc;
        self.doc_spans = new_spans;

        RepairSummary {
            kept,
            dropped,
            chunks_discarded,
        }
    }

    // ============ Persistence ============

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(|e| Error::index_io(dir, e.to_string()))?;

        let mapping = MappingFile {
            vector_index_to_doc_id: self.slot_to_doc.clone(),
            doc_id_to_vector_indices: self
                .doc_spans
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        };
        write_json_atomic(&dir.join(MAPPING_FILE), &mapping)?;
        write_json_atomic(&dir.join(CHUNKS_FILE), &self.slot_to_chunk)?;
        Ok(())
    }

    /// Loads the artifacts from `dir`.
    ///
    /// Missing files yield an empty store. When a mapping exists but
    /// `index_exists` is false the artifacts are orphaned leftovers from a
    /// wiped index; they are deleted and an empty store is returned.
    pub fn load(dir: &Path, index_exists: bool) -> Result<Self> {
        let mapping_path = dir.join(MAPPING_FILE);
        let chunks_path = dir.join(CHUNKS_FILE);

        if !mapping_path.exists() {
            return Ok(Self::new());
        }

        if !index_exists {
            tracing::warn!(
                path = %mapping_path.display(),
                "mapping artifact exists without an index; deleting orphan"
            );
            let _ = std::fs::remove_file(&mapping_path);
            let _ = std::fs::remove_file(&chunks_path);
            return Ok(Self::new());
        }

        let mapping: MappingFile = read_json(&mapping_path)?;
        let slot_to_chunk: BTreeMap<u64, String> = if chunks_path.exists() {
            read_json(&chunks_path)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            slot_to_doc: mapping.vector_index_to_doc_id,
            doc_spans: mapping.doc_id_to_vector_indices.into_iter().collect(),
            slot_to_chunk,
        })
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| Error::index_io(&tmp, e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::index_io(path, e.to_string()))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::index_io(path, e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| Error::index_io(path, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: u64, end: u64) -> IndexSpan {
        IndexSpan {
            start_slot: start,
            end_slot: end,
            file_path: format!("uploads/1/{}-{}.txt", start, end),
        }
    }

    fn chunks(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("chunk text {}", i)).collect()
    }

    fn record(id: &str, status: DocumentStatus, index_span: Option<IndexSpan>) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            user_id: 1,
            stored_name: format!("{}.txt", id),
            original_name: "a.txt".to_string(),
            display_name: None,
            uploaded_at: 0,
            status,
            chunk_count: index_span.as_ref().map(|s| s.len() as i64).unwrap_or(0),
            index_span,
        }
    }

    #[test]
    fn insert_then_verify_holds() {
        let mut store = MappingStore::new();
        store.insert_document("doc-a", &span(0, 3), &chunks(3));
        store.insert_document("doc-b", &span(3, 5), &chunks(2));
        assert!(store.verify(5));
        assert_eq!(store.mapped_slot_count(), 5);
        assert_eq!(store.document_for_slot(4), Some("doc-b"));
    }

    #[test]
    fn removal_leaves_holes_and_stays_consistent() {
        let mut store = MappingStore::new();
        store.insert_document("doc-a", &span(0, 3), &chunks(3));
        store.insert_document("doc-b", &span(3, 5), &chunks(2));

        let removed = store.remove_document("doc-a").unwrap();
        assert_eq!(removed, (0, 3));
        assert!(store.document_for_slot(0).is_none());
        assert!(store.chunk_for_slot(1).is_none());
        // Holes at 0..3 are legal; the law still holds.
        assert!(store.verify(5));
    }

    #[test]
    fn verify_catches_span_past_index_end() {
        let mut store = MappingStore::new();
        store.insert_document("doc-a", &span(0, 4), &chunks(4));
        assert!(store.verify(4));
        assert!(!store.verify(3));
    }

    #[test]
    fn verify_catches_missing_chunk_text() {
        let mut store = MappingStore::new();
        store.insert_document("doc-a", &span(0, 2), &chunks(2));
        store.slot_to_chunk.remove(&1);
        assert!(!store.verify(2));
        let anomalies = store.anomalies(2);
        assert!(anomalies.iter().any(|a| a.contains("no chunk text")));
    }

    #[test]
    fn verify_catches_stray_slot_entry() {
        let mut store = MappingStore::new();
        store.insert_document("doc-a", &span(0, 2), &chunks(2));
        store.slot_to_doc.insert(9, "ghost".to_string());
        assert!(!store.verify(10));
    }

    #[test]
    fn repair_rebuilds_from_catalog() {
        let mut store = MappingStore::new();
        store.insert_document("doc-a", &span(0, 2), &chunks(2));
        store.insert_document("doc-b", &span(2, 4), &chunks(2));
        // Corrupt the slot map, keeping chunk text intact.
        store.slot_to_doc.clear();
        store.doc_spans.clear();
        assert!(store.has_chunks());

        let catalog = vec![
            record("doc-a", DocumentStatus::Processed, Some(span(0, 2))),
            record("doc-b", DocumentStatus::Processed, Some(span(2, 4))),
        ];
        let summary = store.repair(&catalog, 4);
        assert_eq!(summary.kept, vec!["doc-a".to_string(), "doc-b".to_string()]);
        assert!(summary.dropped.is_empty());
        assert!(store.verify(4));
    }

    #[test]
    fn repair_drops_rows_with_bad_spans() {
        let mut store = MappingStore::new();
        store.insert_document("doc-a", &span(0, 2), &chunks(2));

        let catalog = vec![
            record("doc-a", DocumentStatus::Processed, Some(span(0, 2))),
            // Span reaches past the index.
            record("doc-b", DocumentStatus::Processed, Some(span(2, 9))),
            // Processed without a span at all.
            record("doc-c", DocumentStatus::Processed, None),
            // Still processing: not eligible.
            record("doc-d", DocumentStatus::Processing, None),
        ];
        let summary = store.repair(&catalog, 2);
        assert_eq!(summary.kept, vec!["doc-a".to_string()]);
        assert_eq!(summary.dropped.len(), 2);
        assert!(store.verify(2));
    }

    #[test]
    fn repair_resolves_overlaps_deterministically() {
        let mut store = MappingStore::new();
        store.insert_document("doc-a", &span(0, 3), &chunks(3));

        let catalog = vec![
            record("doc-a", DocumentStatus::Processed, Some(span(0, 3))),
            record("doc-b", DocumentStatus::Processed, Some(span(1, 3))),
        ];
        let summary = store.repair(&catalog, 3);
        assert_eq!(summary.kept, vec!["doc-a".to_string()]);
        assert_eq!(summary.dropped[0].document_id, "doc-b");
        assert!(summary.dropped[0].reason.contains("overlaps"));
    }

    #[test]
    fn repair_discards_chunks_outside_spans() {
        let mut store = MappingStore::new();
        store.insert_document("doc-a", &span(0, 2), &chunks(2));
        store.insert_document("doc-b", &span(2, 4), &chunks(2));

        let catalog = vec![record("doc-a", DocumentStatus::Processed, Some(span(0, 2)))];
        let summary = store.repair(&catalog, 4);
        assert_eq!(summary.chunks_discarded, 2);
        assert!(store.chunk_for_slot(2).is_none());
        assert!(store.verify(4));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MappingStore::new();
        store.insert_document("doc-a", &span(0, 2), &chunks(2));
        store.save(dir.path()).unwrap();

        let loaded = MappingStore::load(dir.path(), true).unwrap();
        assert_eq!(loaded.mapped_slot_count(), 2);
        assert_eq!(loaded.document_span("doc-a"), Some((0, 2)));
        assert_eq!(loaded.chunk_for_slot(1), Some("chunk text 1"));
        assert!(loaded.verify(2));
    }

    #[test]
    fn load_without_artifacts_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MappingStore::load(dir.path(), false).unwrap();
        assert_eq!(store.mapped_slot_count(), 0);
    }

    #[test]
    fn orphaned_mapping_is_deleted_when_index_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MappingStore::new();
        store.insert_document("doc-a", &span(0, 2), &chunks(2));
        store.save(dir.path()).unwrap();

        let loaded = MappingStore::load(dir.path(), false).unwrap();
        assert_eq!(loaded.mapped_slot_count(), 0);
        assert!(!dir.path().join(MAPPING_FILE).exists());
        assert!(!dir.path().join(CHUNKS_FILE).exists());
    }

    #[test]
    fn corrupt_mapping_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MAPPING_FILE), "{not json").unwrap();
        let err = MappingStore::load(dir.path(), true).unwrap_err();
        assert!(matches!(err, Error::IndexIo { .. }));
    }
}
