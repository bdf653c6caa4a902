//! The engine: single-writer orchestration of catalog, index, mappings,
//! and cache.
//!
//! All mutating operations (upload finalization, deletion, clear, rebuild)
//! take the write half of one `RwLock` over the index and mapping store,
//! so the pair can never be observed out of step. Queries take the read
//! half. Embedding happens outside the write lock: a slow provider batch
//! must not block readers.
//!
//! On startup the mapping store is verified against the index; when the
//! law fails, a structural repair runs against the catalog and the rows it
//! cannot salvage are marked failed.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::cache::QueryCache;
use crate::catalog;
use crate::config::Config;
use crate::embedding::{self, Embedder};
use crate::error::{Error, Result};
use crate::extract::DocumentFormat;
use crate::index::VectorIndex;
use crate::lifecycle::{self, Compensation};
use crate::mapping::MappingStore;
use crate::models::{
    ConsistencyReport, DocumentRecord, DocumentStatus, IndexSpan, InvalidDocument, QueryOutcome,
    RetrievedChunk,
};

pub const INDEX_FILE: &str = "index.bin";

/// An upload as received from the API layer.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub user_id: i64,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub display_name: Option<String>,
}

/// A stored, cataloged upload that still needs processing.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub document_id: String,
    pub user_id: i64,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub document_id: String,
    pub status: DocumentStatus,
    pub chunk_count: u64,
}

#[derive(Debug, Clone)]
pub struct RebuildSummary {
    pub rebuilt: Vec<String>,
    pub failed: Vec<InvalidDocument>,
}

struct EngineState {
    index: VectorIndex,
    mappings: MappingStore,
}

pub struct Engine {
    config: Config,
    pool: SqlitePool,
    embedder: Box<dyn Embedder>,
    state: RwLock<EngineState>,
    cache: Mutex<QueryCache>,
}

impl Engine {
    /// Loads artifacts from disk and verifies them, repairing structurally
    /// from the catalog when the mapping law does not hold.
    pub async fn open(config: Config, pool: SqlitePool, embedder: Box<dyn Embedder>) -> Result<Self> {
        std::fs::create_dir_all(&config.storage.data_dir)?;
        std::fs::create_dir_all(&config.storage.upload_dir)?;

        let index_path = config.storage.data_dir.join(INDEX_FILE);
        let index_exists = index_path.exists();
        let index = if index_exists {
            VectorIndex::load(&index_path)?
        } else {
            VectorIndex::new(embedder.dims())
        };

        if config.embedding.is_enabled() && index_exists && index.dims() != embedder.dims() {
            tracing::warn!(
                index_dims = index.dims(),
                model_dims = embedder.dims(),
                "index dimensionality differs from the configured model; queries will fail until a rebuild"
            );
        }

        let mut mappings = MappingStore::load(&config.storage.data_dir, index_exists)?;
        if !mappings.verify(index.len()) {
            let anomalies = mappings.anomalies(index.len());
            tracing::warn!(
                anomalies = anomalies.len(),
                "mapping store fails verification, running structural repair"
            );
            let rows = catalog::list_all(&pool).await?;
            let summary = mappings.repair(&rows, index.len());
            for dropped in &summary.dropped {
                tracing::warn!(
                    document_id = %dropped.document_id,
                    reason = %dropped.reason,
                    "document dropped by structural repair"
                );
                catalog::mark_failed(&pool, &dropped.document_id).await?;
            }
            mappings.save(&config.storage.data_dir)?;
            tracing::info!(
                kept = summary.kept.len(),
                dropped = summary.dropped.len(),
                chunks_discarded = summary.chunks_discarded,
                "structural repair finished"
            );
        }

        let ttl = config.cache.ttl_secs;
        Ok(Self {
            config,
            pool,
            embedder,
            state: RwLock::new(EngineState { index, mappings }),
            cache: Mutex::new(QueryCache::new(ttl)),
        })
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn index_len(&self) -> u64 {
        self.state.read().await.index.len()
    }

    // ============ Upload lifecycle ============

    /// Full synchronous ingest: store, catalog, process.
    pub async fn ingest(&self, request: UploadRequest) -> Result<UploadReceipt> {
        let pending = self.register_upload(&request).await?;
        self.process_document(pending).await
    }

    /// Validates and stores the upload, inserting a `processing` catalog
    /// row. The heavy half runs in [`Engine::process_document`], possibly on
    /// a background task.
    pub async fn register_upload(&self, request: &UploadRequest) -> Result<PendingUpload> {
        DocumentFormat::from_path(std::path::Path::new(&request.filename))?;
        let size = request.bytes.len() as u64;
        let limit = self.config.upload.max_bytes;
        if size > limit {
            return Err(Error::OversizedUpload { size, limit });
        }

        let document_id = Uuid::new_v4().to_string();
        let stored_name = format!(
            "{}.{}",
            document_id,
            lifecycle::file_extension(&request.filename)
        );
        let user_dir = self
            .config
            .storage
            .upload_dir
            .join(request.user_id.to_string());
        std::fs::create_dir_all(&user_dir)?;
        let file_path = user_dir.join(&stored_name);
        std::fs::write(&file_path, &request.bytes)?;

        let record = DocumentRecord {
            id: document_id.clone(),
            user_id: request.user_id,
            stored_name,
            original_name: request.filename.clone(),
            display_name: request.display_name.clone(),
            uploaded_at: Utc::now().timestamp(),
            status: DocumentStatus::Processing,
            chunk_count: 0,
            index_span: None,
        };
        if let Err(e) = catalog::insert_processing(&self.pool, &record).await {
            let _ = std::fs::remove_file(&file_path);
            return Err(e);
        }

        tracing::info!(
            document_id = %document_id,
            user_id = request.user_id,
            name = %request.filename,
            size,
            "upload registered"
        );
        Ok(PendingUpload {
            document_id,
            user_id: request.user_id,
            file_path,
        })
    }

    /// Extracts, chunks, embeds, and indexes a registered upload. On any
    /// failure the completed steps are compensated in reverse and the row
    /// is left `failed`.
    pub async fn process_document(&self, pending: PendingUpload) -> Result<UploadReceipt> {
        let mut undo = vec![
            Compensation::RemoveStoredFile(pending.file_path.clone()),
            Compensation::MarkRowFailed(pending.document_id.clone()),
        ];
        match self.process_inner(&pending, &mut undo).await {
            Ok(receipt) => {
                tracing::info!(
                    document_id = %receipt.document_id,
                    chunks = receipt.chunk_count,
                    "document processed"
                );
                Ok(receipt)
            }
            Err(e) => {
                tracing::warn!(
                    document_id = %pending.document_id,
                    error = %e,
                    "upload processing failed, unwinding"
                );
                self.unwind(undo).await;
                Err(e)
            }
        }
    }

    async fn process_inner(
        &self,
        pending: &PendingUpload,
        undo: &mut Vec<Compensation>,
    ) -> Result<UploadReceipt> {
        let bytes = std::fs::read(&pending.file_path)?;
        let prepared = lifecycle::prepare(&pending.file_path, &bytes, &self.config.chunking)?;
        let chunk_count = prepared.chunks.len() as u64;

        // Embed before taking the write lock.
        let vectors = embedding::embed_all(
            self.embedder.as_ref(),
            self.config.embedding.batch_size,
            &prepared.chunks,
        )
        .await?;

        let mut state = self.state.write().await;
        let start_slot = state.index.len();
        state.index.add(&vectors)?;
        let span = IndexSpan {
            start_slot,
            end_slot: start_slot + chunk_count,
            file_path: pending.file_path.display().to_string(),
        };
        state
            .mappings
            .insert_document(&pending.document_id, &span, &prepared.chunks);
        undo.push(Compensation::UnmapDocument(pending.document_id.clone()));

        catalog::finalize(&self.pool, &pending.document_id, &span, chunk_count as i64).await?;
        self.persist(&state)?;
        drop(state);

        self.cache.lock().await.clear();
        Ok(UploadReceipt {
            document_id: pending.document_id.clone(),
            status: DocumentStatus::Processed,
            chunk_count,
        })
    }

    async fn unwind(&self, undo: Vec<Compensation>) {
        for step in undo.into_iter().rev() {
            match step {
                Compensation::RemoveStoredFile(path) => {
                    if let Err(e) = std::fs::remove_file(&path) {
                        tracing::warn!(path = %path.display(), error = %e, "compensation: could not remove stored file");
                    }
                }
                Compensation::MarkRowFailed(id) => {
                    if let Err(e) = catalog::mark_failed(&self.pool, &id).await {
                        tracing::warn!(document_id = %id, error = %e, "compensation: could not mark row failed");
                    }
                }
                Compensation::UnmapDocument(id) => {
                    let mut state = self.state.write().await;
                    state.mappings.remove_document(&id);
                    if let Err(e) = self.persist(&state) {
                        tracing::warn!(document_id = %id, error = %e, "compensation: could not persist after unmap");
                    }
                }
            }
        }
    }

    // ============ Document operations ============

    pub async fn document_status(
        &self,
        id: &str,
        user_id: i64,
        admin: bool,
    ) -> Result<DocumentRecord> {
        let record = catalog::fetch(&self.pool, id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        authorize(&record, user_id, admin)?;
        Ok(record)
    }

    pub async fn list_documents(&self, user_id: i64, all: bool) -> Result<Vec<DocumentRecord>> {
        if all {
            catalog::list_all(&self.pool).await
        } else {
            catalog::list_for_user(&self.pool, user_id).await
        }
    }

    pub async fn rename_document(
        &self,
        id: &str,
        user_id: i64,
        admin: bool,
        name: &str,
    ) -> Result<()> {
        let record = catalog::fetch(&self.pool, id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        authorize(&record, user_id, admin)?;
        catalog::set_display_name(&self.pool, id, name).await
    }

    /// Removes a document's mapping entries (leaving index holes), its
    /// catalog row, and its stored file. The index itself is untouched.
    pub async fn delete_document(&self, id: &str, user_id: i64, admin: bool) -> Result<()> {
        let record = catalog::fetch(&self.pool, id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        authorize(&record, user_id, admin)?;

        let mut state = self.state.write().await;
        state.mappings.remove_document(id);
        catalog::delete(&self.pool, id).await?;
        state.mappings.save(&self.config.storage.data_dir)?;
        drop(state);

        let path = self.stored_path(&record);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), error = %e, "stored file already gone");
        }
        self.cache.lock().await.clear();
        tracing::info!(document_id = %id, "document deleted");
        Ok(())
    }

    // ============ Retrieval ============

    /// Hybrid retrieval: cosine over the index blended with keyword overlap,
    /// thresholded, deduplicated by chunk text.
    pub async fn query(&self, question: &str, top_k: Option<usize>) -> Result<QueryOutcome> {
        if let Some(mut hit) = self.cache.lock().await.get(question) {
            hit.cached = true;
            tracing::debug!("query served from cache");
            return Ok(hit);
        }

        {
            let state = self.state.read().await;
            if state.index.is_empty() || !state.mappings.has_chunks() {
                return Err(Error::EmptyKnowledgeBase);
            }
        }

        let query_vector = embedding::embed_query(self.embedder.as_ref(), question).await?;
        let retrieval = &self.config.retrieval;
        let k = top_k.unwrap_or(retrieval.default_top_k).max(1);
        let fetch = k.saturating_mul(retrieval.overfetch_factor.max(1));

        let state = self.state.read().await;
        let hits = state.index.search(&query_vector, fetch)?;

        let query_words = word_set(question);
        let mut seen = HashSet::new();
        let mut candidates: Vec<(u64, String, f32)> = Vec::new();
        for (slot, semantic) in hits {
            // Slots without a chunk are holes left by deletions.
            let chunk = match state.mappings.chunk_for_slot(slot) {
                Some(c) => c,
                None => continue,
            };
            if !seen.insert(chunk.to_string()) {
                continue;
            }
            let keyword = if query_words.is_empty() {
                0.0
            } else {
                let chunk_words = word_set(chunk);
                query_words.intersection(&chunk_words).count() as f32 / query_words.len() as f32
            };
            let score = retrieval.semantic_weight * semantic + retrieval.keyword_weight * keyword;
            candidates.push((slot, chunk.to_string(), score));
        }
        drop(state);

        candidates.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        candidates.retain(|(_, _, score)| *score >= retrieval.relevance_threshold);
        candidates.truncate(k);

        let relevant_chunks: Vec<RetrievedChunk> = candidates
            .iter()
            .map(|(_, text, score)| RetrievedChunk {
                text: text.clone(),
                score: *score,
            })
            .collect();
        let context = relevant_chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let outcome = QueryOutcome {
            relevant_chunks,
            context,
            cached: false,
        };
        self.cache.lock().await.put(question, outcome.clone());
        Ok(outcome)
    }

    // ============ Admin operations ============

    /// Read-only agreement check across catalog, mappings, and index.
    pub async fn consistency_report(&self) -> Result<ConsistencyReport> {
        let rows = catalog::list_all(&self.pool).await?;
        let state = self.state.read().await;
        let index_len = state.index.len();
        let anomalies = state.mappings.anomalies(index_len);

        let mut processed = 0u64;
        let mut processing = 0u64;
        let mut failed = 0u64;
        let mut valid_documents = Vec::new();
        let mut invalid_documents = Vec::new();

        for row in &rows {
            match row.status {
                DocumentStatus::Processing => processing += 1,
                DocumentStatus::Failed => failed += 1,
                DocumentStatus::Processed => {
                    processed += 1;
                    match check_row(row, &state.mappings, index_len) {
                        None => valid_documents.push(row.id.clone()),
                        Some(reason) => invalid_documents.push(InvalidDocument {
                            document_id: row.id.clone(),
                            reason,
                        }),
                    }
                }
            }
        }

        let mapped_slots = state.mappings.mapped_slot_count();
        let consistent = anomalies.is_empty() && invalid_documents.is_empty();
        Ok(ConsistencyReport {
            index_len,
            mapped_slots,
            chunk_entries: state.mappings.chunk_entry_count(),
            document_rows: rows.len() as u64,
            processed,
            processing,
            failed,
            valid_documents,
            invalid_documents,
            orphaned_slots: index_len.saturating_sub(mapped_slots),
            anomalies,
            consistent,
        })
    }

    /// Wipes everything: catalog rows, artifacts, stored files, cache. The
    /// index is re-initialized empty at the model's dimensionality.
    pub async fn clear_all(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        let removed = catalog::delete_all(&self.pool).await?;

        state.index = VectorIndex::new(self.embedder.dims());
        state.mappings.clear();

        let data_dir = &self.config.storage.data_dir;
        for name in [INDEX_FILE, crate::mapping::MAPPING_FILE, crate::mapping::CHUNKS_FILE] {
            let path = data_dir.join(name);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| Error::index_io(&path, e.to_string()))?;
            }
        }
        let upload_dir = &self.config.storage.upload_dir;
        if upload_dir.exists() {
            std::fs::remove_dir_all(upload_dir)?;
        }
        std::fs::create_dir_all(upload_dir)?;
        drop(state);

        self.cache.lock().await.clear();
        tracing::info!(documents = removed, "knowledge base cleared");
        Ok(removed)
    }

    /// Heavy repair: re-reads every processed document's stored file and
    /// rebuilds the index and mappings from scratch, compacting holes.
    /// Rows whose file is missing or no longer extracts are marked failed.
    pub async fn rebuild_from_catalog(&self) -> Result<RebuildSummary> {
        let mut rows = catalog::list_all(&self.pool).await?;
        rows.retain(|r| r.status == DocumentStatus::Processed);
        rows.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at).then(a.id.cmp(&b.id)));

        let mut state = self.state.write().await;
        let mut index = VectorIndex::new(self.embedder.dims());
        let mut mappings = MappingStore::new();
        let mut rebuilt = Vec::new();
        let mut failed = Vec::new();

        for row in rows {
            let path = self.stored_path(&row);
            let outcome = self
                .reindex_row(&row, &path, &mut index, &mut mappings)
                .await;
            match outcome {
                Ok(()) => rebuilt.push(row.id),
                Err(e) => {
                    tracing::warn!(document_id = %row.id, error = %e, "rebuild: row marked failed");
                    catalog::mark_failed(&self.pool, &row.id).await?;
                    failed.push(InvalidDocument {
                        document_id: row.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        state.index = index;
        state.mappings = mappings;
        self.persist(&state)?;
        drop(state);

        self.cache.lock().await.clear();
        tracing::info!(
            rebuilt = rebuilt.len(),
            failed = failed.len(),
            "rebuild finished"
        );
        Ok(RebuildSummary { rebuilt, failed })
    }

    async fn reindex_row(
        &self,
        row: &DocumentRecord,
        path: &std::path::Path,
        index: &mut VectorIndex,
        mappings: &mut MappingStore,
    ) -> Result<()> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::ExtractionFailed(format!("stored file {} unreadable: {}", path.display(), e))
        })?;
        let prepared = lifecycle::prepare(path, &bytes, &self.config.chunking)?;
        let vectors = embedding::embed_all(
            self.embedder.as_ref(),
            self.config.embedding.batch_size,
            &prepared.chunks,
        )
        .await?;

        let start_slot = index.len();
        index.add(&vectors)?;
        let span = IndexSpan {
            start_slot,
            end_slot: start_slot + prepared.chunks.len() as u64,
            file_path: path.display().to_string(),
        };
        mappings.insert_document(&row.id, &span, &prepared.chunks);
        catalog::finalize(&self.pool, &row.id, &span, prepared.chunks.len() as i64).await?;
        Ok(())
    }

    // ============ Helpers ============

    fn persist(&self, state: &EngineState) -> Result<()> {
        state
            .index
            .save(&self.config.storage.data_dir.join(INDEX_FILE))?;
        state.mappings.save(&self.config.storage.data_dir)?;
        Ok(())
    }

    fn stored_path(&self, record: &DocumentRecord) -> PathBuf {
        self.config
            .storage
            .upload_dir
            .join(record.user_id.to_string())
            .join(&record.stored_name)
    }
}

fn authorize(record: &DocumentRecord, user_id: i64, admin: bool) -> Result<()> {
    if admin || record.user_id == user_id {
        Ok(())
    } else {
        Err(Error::Forbidden)
    }
}

fn check_row(row: &DocumentRecord, mappings: &MappingStore, index_len: u64) -> Option<String> {
    let span = match &row.index_span {
        Some(span) => span,
        None => return Some("processed row has no recorded span".to_string()),
    };
    if span.is_empty() {
        return Some("recorded span is empty".to_string());
    }
    if span.end_slot > index_len {
        return Some(format!(
            "span ends at slot {} but index has {} slots",
            span.end_slot - 1,
            index_len
        ));
    }
    if mappings.document_span(&row.id) != Some((span.start_slot, span.end_slot)) {
        return Some("recorded span disagrees with mapping store".to_string());
    }
    if span.slots().any(|s| mappings.chunk_for_slot(s).is_none()) {
        return Some("span slots are missing chunk text".to_string());
    }
    if row.chunk_count as u64 != span.len() {
        return Some(format!(
            "chunk_count {} disagrees with span length {}",
            row.chunk_count,
            span.len()
        ));
    }
    None
}

/// Lowercase set of unicode-alphanumeric word runs.
fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}
