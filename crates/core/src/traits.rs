use crate::error::StorageError;
use crate::models::{Chunk, ChunkMatch, Document, NewDocument, StatusUpdate};
use async_trait::async_trait;

/// Persistence for documents, their chunks and vector search over them.
///
/// Calls taking an `owner_id` only see documents owned by that caller. When
/// it is `None` the call is unscoped, which only trusted callers should use.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Embedding dimension this store accepts.
    fn dimensions(&self) -> usize;

    async fn create_document(&self, document: NewDocument) -> Result<String, StorageError>;

    async fn update_document_status(
        &self,
        document_id: &str,
        update: StatusUpdate,
    ) -> Result<(), StorageError>;

    /// Inserts all chunks or none of them. Returns the number inserted.
    async fn batch_insert_chunks(&self, chunks: &[Chunk]) -> Result<usize, StorageError>;

    /// Returns the number of chunks removed.
    async fn delete_chunks(&self, document_id: &str) -> Result<usize, StorageError>;

    async fn search_by_subject(
        &self,
        query: &[f32],
        subject: &str,
        owner_id: &str,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ChunkMatch>, StorageError>;

    async fn search_within_document(
        &self,
        query: &[f32],
        document_id: &str,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ChunkMatch>, StorageError>;

    async fn get_document(
        &self,
        document_id: &str,
        owner_id: Option<&str>,
    ) -> Result<Option<Document>, StorageError>;

    /// Newest upload first.
    async fn list_documents(
        &self,
        owner_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Document>, StorageError>;

    async fn delete_document(
        &self,
        document_id: &str,
        owner_id: Option<&str>,
    ) -> Result<bool, StorageError>;

    /// Distinct subjects across the owner's documents, sorted.
    async fn list_subjects(&self, owner_id: &str) -> Result<Vec<String>, StorageError>;

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>, StorageError>;

    async fn count_chunks(&self, document_id: &str) -> Result<usize, StorageError>;
}
