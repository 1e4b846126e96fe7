use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::time::Duration;

use crate::chunking::ChunkingConfig;

pub const DEFAULT_SUBJECT: &str = "general";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub subject: String,
    pub description: Option<String>,
    pub original_filename: String,
    pub stored_filename: String,
    pub file_size: u64,
    pub checksum: String,
    pub page_count: Option<u32>,
    pub status: DocumentStatus,
    pub error: Option<String>,
    pub total_chunks: usize,
    pub uploaded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a document record is first created; the store
/// assigns the id and timestamps and starts it as `pending`.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: String,
    pub subject: String,
    pub description: Option<String>,
    pub original_filename: String,
    pub stored_filename: String,
    pub file_size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: DocumentStatus,
    pub total_chunks: Option<usize>,
    pub page_count: Option<u32>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn processing() -> Self {
        Self {
            status: DocumentStatus::Processing,
            total_chunks: None,
            page_count: None,
            error: None,
        }
    }

    pub fn completed(total_chunks: usize, page_count: u32) -> Self {
        Self {
            status: DocumentStatus::Completed,
            total_chunks: Some(total_chunks),
            page_count: Some(page_count),
            error: None,
        }
    }

    /// Completion that keeps a non-fatal problem visible on the document.
    pub fn completed_with_warnings(
        total_chunks: usize,
        page_count: u32,
        warnings: &[FailureDetail],
    ) -> Self {
        let error = (!warnings.is_empty()).then(|| {
            warnings
                .iter()
                .map(FailureDetail::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        });
        Self {
            error,
            ..Self::completed(total_chunks, page_count)
        }
    }

    pub fn failed(detail: &FailureDetail) -> Self {
        Self {
            status: DocumentStatus::Failed,
            total_chunks: Some(0),
            page_count: None,
            error: Some(detail.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Layout,
    Sequential,
    Fallback,
}

impl ExtractionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Layout => "layout",
            Self::Sequential => "sequential",
            Self::Fallback => "fallback",
        }
    }
}

/// A window of extracted text before it is bound to a stored document.
/// Offsets count characters, not bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedChunk {
    pub content: String,
    pub chunk_index: u32,
    pub page_number: u32,
    pub chunk_size: usize,
    pub start_char: usize,
    pub end_char: usize,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    pub method: ExtractionMethod,
    pub total_pages: u32,
    pub processed_pages: u32,
    pub successful_pages: u32,
    pub total_characters: usize,
    pub text_truncated: bool,
    pub chunk_limit_reached: bool,
    pub errors: Vec<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub chunks: Vec<ExtractedChunk>,
    pub metadata: ExtractionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub page_number: u32,
    pub content: String,
    pub chunk_size: usize,
    pub token_count: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub extraction_method: ExtractionMethod,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

/// A chunk returned by a similarity search, joined with its document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub subject: String,
    pub chunk_index: u32,
    pub page_number: u32,
    pub content: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedChunk {
    #[serde(flatten)]
    pub matched: ChunkMatch,
    pub relevance: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    VectorSimilarity,
    SubjectSpecific,
    CrossSubject,
    DocumentScoped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetrievalScope {
    General,
    Document {
        document_id: String,
        document_name: String,
    },
}

impl RetrievalScope {
    pub fn is_document(&self) -> bool {
        matches!(self, Self::Document { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextSummary {
    pub total_chunks: usize,
    pub sources: Vec<String>,
    pub topics: Vec<String>,
    pub avg_similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunks: Vec<RankedChunk>,
    pub total_found: usize,
    pub strategies_used: Vec<SearchStrategy>,
    pub failed_strategies: Vec<SearchStrategy>,
    pub scope: RetrievalScope,
    pub summary: ContextSummary,
}

impl RetrievalResult {
    pub fn empty(scope: RetrievalScope) -> Self {
        Self {
            chunks: Vec::new(),
            total_found: 0,
            strategies_used: Vec::new(),
            failed_strategies: Vec::new(),
            scope,
            summary: ContextSummary::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Validation,
    Extraction,
    Embedding,
    Storage,
    Retrieval,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureDetail {
    pub stage: FailureStage,
    pub message: String,
}

impl FailureDetail {
    pub fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = serde_json::to_value(self.stage)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{stage}: {}", self.message)
    }
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub owner_id: String,
    pub subject: Option<String>,
    pub description: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub success: bool,
    pub document_id: Option<String>,
    pub total_chunks: usize,
    pub embedded_chunks: usize,
    pub processing_time_seconds: f64,
    pub extraction: Option<ExtractionMetadata>,
    pub error: Option<FailureDetail>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessingStats {
    pub total_documents: usize,
    pub completed: usize,
    pub processing: usize,
    pub pending: usize,
    pub failed: usize,
    pub total_chunks: usize,
    pub avg_chunks_per_completed: f64,
}

impl ProcessingStats {
    pub fn from_documents(documents: &[Document]) -> Self {
        let mut stats = Self {
            total_documents: documents.len(),
            ..Self::default()
        };

        for document in documents {
            match document.status {
                DocumentStatus::Pending => stats.pending += 1,
                DocumentStatus::Processing => stats.processing += 1,
                DocumentStatus::Completed => stats.completed += 1,
                DocumentStatus::Failed => stats.failed += 1,
            }
            stats.total_chunks += document.total_chunks;
        }

        if stats.completed > 0 {
            let avg = stats.total_chunks as f64 / stats.completed as f64;
            stats.avg_chunks_per_completed = (avg * 100.0).round() / 100.0;
        }

        stats
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub max_file_bytes: usize,
    pub max_pages: u32,
    pub max_chars_per_page: usize,
    pub max_raw_chars_per_page: usize,
    pub max_total_chars: usize,
    pub method_timeout: Duration,
    pub chunking: ChunkingConfig,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            max_file_bytes: 100 * 1024 * 1024,
            max_pages: 1_000,
            max_chars_per_page: 15_000,
            max_raw_chars_per_page: 5_000,
            max_total_chars: 10 * 1024 * 1024,
            method_timeout: Duration::from_secs(45),
            chunking: ChunkingConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingOptions {
    pub max_batch_size: usize,
    pub max_concurrent_batches: usize,
    pub inter_group_delay: Duration,
    pub batch_timeout: Duration,
}

impl Default for EmbeddingOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_concurrent_batches: 10,
            inter_group_delay: Duration::from_millis(100),
            batch_timeout: Duration::from_secs(30),
        }
    }
}

/// Additive bonuses applied on top of vector similarity when re-ranking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingWeights {
    pub keyword_bonus: f32,
    pub type_match_bonus: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            keyword_bonus: 0.1,
            type_match_bonus: 0.15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub max_chunks: usize,
    pub subject_threshold: f32,
    pub cross_subject_threshold: f32,
    pub per_subject_limit: usize,
    pub document_threshold: f32,
    pub weights: RankingWeights,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            max_chunks: 5,
            subject_threshold: 0.7,
            cross_subject_threshold: 0.6,
            per_subject_limit: 2,
            document_threshold: 0.2,
            weights: RankingWeights::default(),
        }
    }
}
