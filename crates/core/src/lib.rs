pub mod answer;
pub mod chunking;
pub mod composer;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod question;
pub mod retriever;
pub mod store;
pub mod stores;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;

pub use answer::{AnswerResponse, QuestionRequest, QuestionService};
pub use chunking::{chunk_text, normalize_whitespace, ChunkingConfig};
pub use composer::{
    AnswerComposer, ComposedAnswer, ComposerOptions, Grounding, LearningStyle, ModelTiers,
    UserPreferences,
};
pub use embeddings::{
    CharacterNgramEmbedder, DisabledEmbedder, EmbeddingEngine, EmbeddingProvider, OpenAiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EmbeddingError, IngestError, ModelError, RetrievalError, StorageError};
pub use extractor::{LopdfExtractor, PdfExtractor, SequentialExtractor, TextExtractor};
pub use ingest::{
    discover_pdf_files, processing_stats, FolderReport, IngestionPipeline, SkippedPdf,
};
pub use llm::{
    DisabledModel, GeminiModel, GenerationParams, LanguageModel, OpenAiChatModel,
    DEFAULT_GEMINI_BASE_URL, DEFAULT_OPENAI_BASE_URL,
};
pub use models::{
    Chunk, Document, DocumentStatus, EmbeddingOptions, ExtractionOptions, IngestOutcome,
    IngestRequest, ProcessingStats, RetrievalOptions, RetrievalResult,
};
pub use question::{KeywordClassifier, QuestionAnalysis, QuestionClassifier, UserContext};
pub use retriever::ContextRetriever;
pub use stores::MemoryStore;
pub use traits::DocumentStore;
