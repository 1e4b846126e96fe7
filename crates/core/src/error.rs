use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("extraction task aborted: {0}")]
    TaskAborted(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("embedding batch timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("embedding dimension {actual} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("language model provider is disabled")]
    Disabled,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("every search strategy failed: {0}")]
    AllStrategiesFailed(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
