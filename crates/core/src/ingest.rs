use crate::chunking::{estimate_tokens, make_chunk_id};
use crate::embeddings::EmbeddingEngine;
use crate::error::{IngestError, StorageError};
use crate::extractor::TextExtractor;
use crate::models::{
    Chunk, Extraction, ExtractionMetadata, ExtractionMethod, FailureDetail, FailureStage,
    IngestOutcome,
    IngestRequest, NewDocument, ProcessingStats, StatusUpdate, DEFAULT_SUBJECT,
};
use crate::traits::DocumentStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        if has_pdf_extension(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

fn has_pdf_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `YYYYmmdd_HHMMSS_<stem>.pdf`, keeping only alphanumerics, spaces, `-`
/// and `_` from the original stem.
pub fn generate_stored_filename(original: &str, now: DateTime<Utc>) -> String {
    let stem = Path::new(original)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    let sanitized: String = stem
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let sanitized = sanitized.trim();
    let stem = if sanitized.is_empty() {
        "document"
    } else {
        sanitized
    };

    format!("{}_{stem}.pdf", now.format("%Y%m%d_%H%M%S"))
}

pub async fn processing_stats(
    store: &dyn DocumentStore,
    owner_id: Option<&str>,
) -> Result<ProcessingStats, StorageError> {
    let documents = store.list_documents(owner_id, usize::MAX, 0).await?;
    Ok(ProcessingStats::from_documents(&documents))
}

#[derive(Debug, Serialize)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct IngestedPdf {
    pub path: PathBuf,
    pub outcome: IngestOutcome,
}

#[derive(Debug, Serialize)]
pub struct FolderReport {
    pub ingested: Vec<IngestedPdf>,
    pub skipped_files: Vec<SkippedPdf>,
}

/// Extract, embed and persist one document at a time, recording each
/// stage on the document's status.
pub struct IngestionPipeline {
    extractor: TextExtractor,
    engine: Arc<EmbeddingEngine>,
    store: Arc<dyn DocumentStore>,
}

impl IngestionPipeline {
    pub fn new(
        extractor: TextExtractor,
        engine: Arc<EmbeddingEngine>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            extractor,
            engine,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Returns `Err` only for input rejected before a document record
    /// exists. Every later failure comes back as an unsuccessful outcome
    /// and leaves the document `failed` with no chunks. A successful outcome
    /// still carries `error` when fallback content or missing vectors were
    /// stored; the same detail is recorded on the completed document.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, IngestError> {
        let started = Instant::now();
        validate_request(&request)?;
        self.extractor.validate(&request.bytes)?;

        let subject = request
            .subject
            .as_deref()
            .map(str::trim)
            .filter(|subject| !subject.is_empty())
            .unwrap_or(DEFAULT_SUBJECT)
            .to_string();

        let new_document = NewDocument {
            owner_id: request.owner_id.clone(),
            subject,
            description: request.description.clone(),
            original_filename: request.filename.clone(),
            stored_filename: generate_stored_filename(&request.filename, Utc::now()),
            file_size: request.bytes.len() as u64,
            checksum: digest_bytes(&request.bytes),
        };

        let document_id = match self.store.create_document(new_document).await {
            Ok(id) => id,
            Err(error) => {
                error!(filename = %request.filename, %error, "could not create document record");
                return Ok(failed_outcome(
                    None,
                    started,
                    None,
                    FailureDetail::new(FailureStage::Storage, error.to_string()),
                ));
            }
        };
        info!(document_id = %document_id, filename = %request.filename, "document created");

        if let Err(error) = self
            .store
            .update_document_status(&document_id, StatusUpdate::processing())
            .await
        {
            let detail = FailureDetail::new(FailureStage::Storage, error.to_string());
            return Ok(self.abort(&document_id, started, None, detail).await);
        }

        let Extraction { chunks, metadata } = self
            .extractor
            .extract_validated(&request.bytes, &request.filename)
            .await;

        let mut warnings = Vec::new();
        if metadata.method == ExtractionMethod::Fallback {
            warnings.push(FailureDetail::new(
                FailureStage::Extraction,
                format!(
                    "no readable text, stored fallback content ({})",
                    metadata.errors.join("; ")
                ),
            ));
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let vectors = self.engine.embed_batch(&texts).await;
        let store_dimensions = self.store.dimensions();

        let rows: Vec<Chunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| Chunk {
                chunk_id: make_chunk_id(&document_id, chunk.chunk_index, &chunk.content),
                document_id: document_id.clone(),
                chunk_index: chunk.chunk_index,
                page_number: chunk.page_number,
                token_count: estimate_tokens(&chunk.content),
                chunk_size: chunk.chunk_size,
                start_char: chunk.start_char,
                end_char: chunk.end_char,
                extraction_method: metadata.method,
                embedding: vector.filter(|vector| vector.len() == store_dimensions),
                content: chunk.content,
            })
            .collect();
        let embedded_chunks = rows.iter().filter(|row| row.embedding.is_some()).count();
        if embedded_chunks < rows.len() {
            warn!(
                document_id = %document_id,
                embedded_chunks,
                total_chunks = rows.len(),
                "some chunks stored without embeddings"
            );
            warnings.push(FailureDetail::new(
                FailureStage::Embedding,
                format!(
                    "{} of {} chunks stored without vectors",
                    rows.len() - embedded_chunks,
                    rows.len()
                ),
            ));
        }

        if let Err(error) = self.store.batch_insert_chunks(&rows).await {
            let detail = FailureDetail::new(FailureStage::Storage, error.to_string());
            return Ok(self.abort(&document_id, started, Some(metadata), detail).await);
        }

        let completed =
            StatusUpdate::completed_with_warnings(rows.len(), metadata.total_pages, &warnings);
        if let Err(error) = self.store.update_document_status(&document_id, completed).await {
            let detail = FailureDetail::new(FailureStage::Storage, error.to_string());
            return Ok(self.abort(&document_id, started, Some(metadata), detail).await);
        }

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            document_id = %document_id,
            chunk_count = rows.len(),
            embedded_chunks,
            method = metadata.method.as_str(),
            elapsed_seconds = elapsed,
            "document ingested"
        );

        Ok(IngestOutcome {
            success: true,
            document_id: Some(document_id),
            total_chunks: rows.len(),
            embedded_chunks,
            processing_time_seconds: elapsed,
            extraction: Some(metadata),
            error: warnings.into_iter().next(),
        })
    }

    /// Ingests every PDF under `folder`. Files rejected by validation or
    /// unreadable from disk are reported as skipped.
    pub async fn ingest_folder(
        &self,
        folder: &Path,
        owner_id: &str,
        subject: Option<&str>,
    ) -> Result<FolderReport, IngestError> {
        let files = discover_pdf_files(folder);
        if files.is_empty() {
            return Err(IngestError::Validation(format!(
                "no pdf files found in {}",
                folder.display()
            )));
        }

        let mut ingested = Vec::new();
        let mut skipped_files = Vec::new();

        for path in files {
            match self.ingest_path(&path, owner_id, subject, None).await {
                Ok(outcome) => ingested.push(IngestedPdf { path, outcome }),
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipped pdf");
                    skipped_files.push(SkippedPdf {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(FolderReport {
            ingested,
            skipped_files,
        })
    }

    pub async fn ingest_path(
        &self,
        path: &Path,
        owner_id: &str,
        subject: Option<&str>,
        description: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                IngestError::Validation(format!("path missing filename: {}", path.display()))
            })?
            .to_string();

        self.ingest(IngestRequest {
            bytes,
            filename,
            owner_id: owner_id.to_string(),
            subject: subject.map(str::to_string),
            description: description.map(str::to_string),
        })
        .await
    }

    /// Removes any chunks written by this attempt and marks the document
    /// failed.
    async fn abort(
        &self,
        document_id: &str,
        started: Instant,
        extraction: Option<ExtractionMetadata>,
        detail: FailureDetail,
    ) -> IngestOutcome {
        error!(document_id, error = %detail, "document ingestion failed");

        if let Err(cleanup) = self.store.delete_chunks(document_id).await {
            error!(document_id, error = %cleanup, "could not remove partial chunks");
        }
        if let Err(status) = self
            .store
            .update_document_status(document_id, StatusUpdate::failed(&detail))
            .await
        {
            error!(document_id, error = %status, "could not mark document failed");
        }

        failed_outcome(Some(document_id.to_string()), started, extraction, detail)
    }
}

fn validate_request(request: &IngestRequest) -> Result<(), IngestError> {
    if request.owner_id.trim().is_empty() {
        return Err(IngestError::Validation("owner id is required".to_string()));
    }
    if request.filename.trim().is_empty() {
        return Err(IngestError::Validation("filename is required".to_string()));
    }
    if !has_pdf_extension(Path::new(&request.filename)) {
        return Err(IngestError::Validation(format!(
            "only pdf files are supported: {}",
            request.filename
        )));
    }
    Ok(())
}

fn failed_outcome(
    document_id: Option<String>,
    started: Instant,
    extraction: Option<ExtractionMetadata>,
    detail: FailureDetail,
) -> IngestOutcome {
    IngestOutcome {
        success: false,
        document_id,
        total_chunks: 0,
        embedded_chunks: 0,
        processing_time_seconds: started.elapsed().as_secs_f64(),
        extraction,
        error: Some(detail),
    }
}
