use crate::error::StorageError;
use crate::models::{
    Chunk, ChunkMatch, Document, DocumentStatus, NewDocument, StatusUpdate,
};
use crate::store::{base64_to_vec, cosine_similarity, vec_to_base64};
use crate::traits::DocumentStore;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

const SNAPSHOT_VERSION: u32 = 1;

/// Process-local store. Everything lives behind one lock, so each call is
/// atomic with respect to the others.
pub struct MemoryStore {
    dimensions: usize,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    documents: HashMap<String, Document>,
    /// Creation order, used to break ties between equal upload times.
    order: Vec<String>,
    chunks: HashMap<String, Vec<Chunk>>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    dimensions: usize,
    documents: Vec<Document>,
    chunks: Vec<StoredChunk>,
}

#[derive(Serialize, Deserialize)]
struct StoredChunk {
    #[serde(flatten)]
    chunk: Chunk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    embedding: Option<String>,
}

impl MemoryStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            state: RwLock::new(State::default()),
        }
    }

    /// Loads the snapshot at `path`, or starts empty when there is none.
    pub async fn open(path: &Path, dimensions: usize) -> Result<Self, StorageError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Self::from_snapshot(&bytes, dimensions),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no snapshot found, starting empty store");
                Ok(Self::new(dimensions))
            }
            Err(error) => Err(error.into()),
        }
    }

    fn from_snapshot(bytes: &[u8], dimensions: usize) -> Result<Self, StorageError> {
        let snapshot: Snapshot = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StorageError::CorruptSnapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.dimensions != dimensions {
            return Err(StorageError::DimensionMismatch {
                expected: dimensions,
                actual: snapshot.dimensions,
            });
        }

        let mut state = State::default();
        for document in snapshot.documents {
            state.order.push(document.id.clone());
            state.documents.insert(document.id.clone(), document);
        }

        for stored in snapshot.chunks {
            let mut chunk = stored.chunk;
            if !state.documents.contains_key(&chunk.document_id) {
                return Err(StorageError::CorruptSnapshot(format!(
                    "chunk {} references missing document {}",
                    chunk.chunk_id, chunk.document_id
                )));
            }
            if let Some(encoded) = stored.embedding {
                let vector = base64_to_vec(&encoded)?;
                if vector.len() != dimensions {
                    return Err(StorageError::CorruptSnapshot(format!(
                        "chunk {} has a {}-dimension embedding",
                        chunk.chunk_id,
                        vector.len()
                    )));
                }
                chunk.embedding = Some(vector);
            }
            state
                .chunks
                .entry(chunk.document_id.clone())
                .or_default()
                .push(chunk);
        }

        for chunks in state.chunks.values_mut() {
            chunks.sort_by_key(|chunk| chunk.chunk_index);
        }

        info!(
            documents = state.documents.len(),
            chunks = state.chunks.values().map(Vec::len).sum::<usize>(),
            "loaded store snapshot"
        );

        Ok(Self {
            dimensions,
            state: RwLock::new(state),
        })
    }

    /// Writes the whole store to `path` through a temporary sibling file.
    pub async fn save(&self, path: &Path) -> Result<(), StorageError> {
        let bytes = {
            let state = self.state.read().await;
            let snapshot = Snapshot {
                version: SNAPSHOT_VERSION,
                dimensions: self.dimensions,
                documents: state
                    .order
                    .iter()
                    .filter_map(|id| state.documents.get(id).cloned())
                    .collect(),
                chunks: state
                    .order
                    .iter()
                    .filter_map(|id| state.chunks.get(id))
                    .flatten()
                    .map(|chunk| StoredChunk {
                        embedding: chunk.embedding.as_deref().map(vec_to_base64),
                        chunk: chunk.clone(),
                    })
                    .collect(),
            };
            serde_json::to_vec_pretty(&snapshot)?
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    fn check_query(&self, query: &[f32]) -> Result<(), StorageError> {
        if query.len() != self.dimensions {
            return Err(StorageError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        Ok(())
    }
}

fn owned_by(document: &Document, owner_id: Option<&str>) -> bool {
    owner_id.map_or(true, |owner| document.owner_id == owner)
}

fn score_chunks<'a>(
    document: &Document,
    chunks: impl Iterator<Item = &'a Chunk>,
    query: &[f32],
    dimensions: usize,
    threshold: f32,
) -> Vec<ChunkMatch> {
    chunks
        .filter_map(|chunk| {
            let embedding = chunk.embedding.as_deref()?;
            if embedding.len() != dimensions {
                return None;
            }
            let similarity = cosine_similarity(query, embedding);
            (similarity >= threshold).then(|| ChunkMatch {
                chunk_id: chunk.chunk_id.clone(),
                document_id: document.id.clone(),
                document_name: document.original_filename.clone(),
                subject: document.subject.clone(),
                chunk_index: chunk.chunk_index,
                page_number: chunk.page_number,
                content: chunk.content.clone(),
                similarity,
            })
        })
        .collect()
}

fn best_first(mut matches: Vec<ChunkMatch>, limit: usize) -> Vec<ChunkMatch> {
    matches.sort_by(|left, right| {
        right
            .similarity
            .total_cmp(&left.similarity)
            .then_with(|| left.document_id.cmp(&right.document_id))
            .then_with(|| left.chunk_index.cmp(&right.chunk_index))
    });
    matches.truncate(limit);
    matches
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn create_document(&self, document: NewDocument) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = Document {
            id: id.clone(),
            owner_id: document.owner_id,
            subject: document.subject,
            description: document.description,
            original_filename: document.original_filename,
            stored_filename: document.stored_filename,
            file_size: document.file_size,
            checksum: document.checksum,
            page_count: None,
            status: DocumentStatus::Pending,
            error: None,
            total_chunks: 0,
            uploaded_at: now,
            updated_at: now,
        };

        let mut state = self.state.write().await;
        state.order.push(id.clone());
        state.documents.insert(id.clone(), record);
        Ok(id)
    }

    async fn update_document_status(
        &self,
        document_id: &str,
        update: StatusUpdate,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let document = state
            .documents
            .get_mut(document_id)
            .ok_or_else(|| StorageError::NotFound(document_id.to_string()))?;

        document.status = update.status;
        if let Some(total_chunks) = update.total_chunks {
            document.total_chunks = total_chunks;
        }
        if let Some(page_count) = update.page_count {
            document.page_count = Some(page_count);
        }
        document.error = update.error;
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn batch_insert_chunks(&self, chunks: &[Chunk]) -> Result<usize, StorageError> {
        let mut state = self.state.write().await;

        let mut seen = HashSet::new();
        for chunk in chunks {
            if !state.documents.contains_key(&chunk.document_id) {
                return Err(StorageError::NotFound(chunk.document_id.clone()));
            }
            if let Some(embedding) = &chunk.embedding {
                if embedding.len() != self.dimensions {
                    return Err(StorageError::DimensionMismatch {
                        expected: self.dimensions,
                        actual: embedding.len(),
                    });
                }
            }
            let duplicate = !seen.insert(chunk.chunk_id.as_str())
                || state
                    .chunks
                    .get(&chunk.document_id)
                    .is_some_and(|existing| {
                        existing.iter().any(|other| other.chunk_id == chunk.chunk_id)
                    });
            if duplicate {
                return Err(StorageError::Backend(format!(
                    "duplicate chunk id {}",
                    chunk.chunk_id
                )));
            }
        }

        for chunk in chunks {
            state
                .chunks
                .entry(chunk.document_id.clone())
                .or_default()
                .push(chunk.clone());
        }
        for stored in state.chunks.values_mut() {
            stored.sort_by_key(|chunk| chunk.chunk_index);
        }

        Ok(chunks.len())
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<usize, StorageError> {
        let mut state = self.state.write().await;
        Ok(state
            .chunks
            .remove(document_id)
            .map_or(0, |removed| removed.len()))
    }

    async fn search_by_subject(
        &self,
        query: &[f32],
        subject: &str,
        owner_id: &str,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ChunkMatch>, StorageError> {
        self.check_query(query)?;
        let state = self.state.read().await;

        let matches = state
            .documents
            .values()
            .filter(|document| {
                document.owner_id == owner_id
                    && document.status == DocumentStatus::Completed
                    && document.subject.eq_ignore_ascii_case(subject)
            })
            .flat_map(|document| {
                let chunks = state.chunks.get(&document.id).into_iter().flatten();
                score_chunks(document, chunks, query, self.dimensions, threshold)
            })
            .collect();

        Ok(best_first(matches, limit))
    }

    async fn search_within_document(
        &self,
        query: &[f32],
        document_id: &str,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ChunkMatch>, StorageError> {
        self.check_query(query)?;
        let state = self.state.read().await;

        let Some(document) = state
            .documents
            .get(document_id)
            .filter(|document| document.status == DocumentStatus::Completed)
        else {
            return Ok(Vec::new());
        };

        let chunks = state.chunks.get(document_id).into_iter().flatten();
        let matches = score_chunks(document, chunks, query, self.dimensions, threshold);
        Ok(best_first(matches, limit))
    }

    async fn get_document(
        &self,
        document_id: &str,
        owner_id: Option<&str>,
    ) -> Result<Option<Document>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .documents
            .get(document_id)
            .filter(|document| owned_by(document, owner_id))
            .cloned())
    }

    async fn list_documents(
        &self,
        owner_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Document>, StorageError> {
        let state = self.state.read().await;
        let mut documents: Vec<Document> = state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.documents.get(id))
            .filter(|document| owned_by(document, owner_id))
            .cloned()
            .collect();
        documents.sort_by(|left, right| right.uploaded_at.cmp(&left.uploaded_at));

        Ok(documents.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete_document(
        &self,
        document_id: &str,
        owner_id: Option<&str>,
    ) -> Result<bool, StorageError> {
        let mut state = self.state.write().await;
        let allowed = state
            .documents
            .get(document_id)
            .is_some_and(|document| owned_by(document, owner_id));
        if !allowed {
            return Ok(false);
        }

        let removed_chunks = state.chunks.remove(document_id).map_or(0, |chunks| chunks.len());
        state.documents.remove(document_id);
        state.order.retain(|id| id != document_id);
        info!(document_id, removed_chunks, "document deleted");
        Ok(true)
    }

    async fn list_subjects(&self, owner_id: &str) -> Result<Vec<String>, StorageError> {
        let state = self.state.read().await;
        let subjects: BTreeSet<String> = state
            .documents
            .values()
            .filter(|document| document.owner_id == owner_id)
            .map(|document| document.subject.clone())
            .collect();
        Ok(subjects.into_iter().collect())
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .chunks
            .values()
            .flatten()
            .find(|chunk| chunk.chunk_id == chunk_id)
            .cloned())
    }

    async fn count_chunks(&self, document_id: &str) -> Result<usize, StorageError> {
        let state = self.state.read().await;
        Ok(state.chunks.get(document_id).map_or(0, Vec::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionMethod;
    use tempfile::tempdir;

    fn new_document(owner: &str, subject: &str, name: &str) -> NewDocument {
        NewDocument {
            owner_id: owner.to_string(),
            subject: subject.to_string(),
            description: None,
            original_filename: name.to_string(),
            stored_filename: format!("20240101_000000_{name}"),
            file_size: 1_024,
            checksum: "abc".to_string(),
        }
    }

    fn chunk(document_id: &str, index: u32, embedding: Option<Vec<f32>>) -> Chunk {
        Chunk {
            chunk_id: format!("{document_id}-{index}"),
            document_id: document_id.to_string(),
            chunk_index: index,
            page_number: 1,
            content: format!("chunk {index}"),
            chunk_size: 7,
            token_count: 2,
            start_char: 0,
            end_char: 7,
            extraction_method: ExtractionMethod::Layout,
            embedding,
        }
    }

    async fn completed_document(
        store: &MemoryStore,
        owner: &str,
        subject: &str,
        chunks: Vec<Option<Vec<f32>>>,
    ) -> Result<String, StorageError> {
        let id = store
            .create_document(new_document(owner, subject, "notes.pdf"))
            .await?;
        let rows: Vec<Chunk> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, embedding)| chunk(&id, index as u32, embedding))
            .collect();
        store.batch_insert_chunks(&rows).await?;
        store
            .update_document_status(&id, StatusUpdate::completed(rows.len(), 1))
            .await?;
        Ok(id)
    }

    #[tokio::test]
    async fn subject_search_is_owner_scoped_and_sorted() -> Result<(), StorageError> {
        let store = MemoryStore::new(2);
        let mine = completed_document(
            &store,
            "alice",
            "physics",
            vec![Some(vec![1.0, 0.0]), Some(vec![0.8, 0.6]), None],
        )
        .await?;
        completed_document(&store, "bob", "physics", vec![Some(vec![1.0, 0.0])]).await?;

        let matches = store
            .search_by_subject(&[1.0, 0.0], "Physics", "alice", 0.5, 10)
            .await?;

        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|found| found.document_id == mine));
        assert!(matches[0].similarity > matches[1].similarity);
        assert_eq!(matches[0].chunk_index, 0);
        Ok(())
    }

    #[tokio::test]
    async fn search_skips_documents_that_are_not_completed() -> Result<(), StorageError> {
        let store = MemoryStore::new(2);
        let id = store
            .create_document(new_document("alice", "physics", "a.pdf"))
            .await?;
        store
            .batch_insert_chunks(&[chunk(&id, 0, Some(vec![1.0, 0.0]))])
            .await?;
        store
            .update_document_status(&id, StatusUpdate::processing())
            .await?;

        let by_subject = store
            .search_by_subject(&[1.0, 0.0], "physics", "alice", 0.0, 5)
            .await?;
        let within = store
            .search_within_document(&[1.0, 0.0], &id, 0.0, 5)
            .await?;
        assert!(by_subject.is_empty());
        assert!(within.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn wrong_dimension_insert_is_rejected_atomically() -> Result<(), StorageError> {
        let store = MemoryStore::new(2);
        let id = store
            .create_document(new_document("alice", "math", "a.pdf"))
            .await?;

        let result = store
            .batch_insert_chunks(&[
                chunk(&id, 0, Some(vec![1.0, 0.0])),
                chunk(&id, 1, Some(vec![1.0, 0.0, 0.0])),
            ])
            .await;

        assert!(matches!(
            result,
            Err(StorageError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert_eq!(store.count_chunks(&id).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn unembedded_chunk_is_still_retrievable_by_id() -> Result<(), StorageError> {
        let store = MemoryStore::new(2);
        let id = completed_document(&store, "alice", "math", vec![None]).await?;

        let found = store.get_chunk(&format!("{id}-0")).await?;
        assert!(found.is_some_and(|chunk| chunk.embedding.is_none()));
        assert!(store
            .search_within_document(&[1.0, 0.0], &id, -1.0, 5)
            .await?
            .is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_paged() -> Result<(), StorageError> {
        let store = MemoryStore::new(2);
        let first = store
            .create_document(new_document("alice", "math", "1.pdf"))
            .await?;
        let second = store
            .create_document(new_document("alice", "math", "2.pdf"))
            .await?;
        let third = store
            .create_document(new_document("alice", "math", "3.pdf"))
            .await?;
        store
            .create_document(new_document("bob", "math", "x.pdf"))
            .await?;

        let page = store.list_documents(Some("alice"), 2, 0).await?;
        let ids: Vec<&str> = page.iter().map(|document| document.id.as_str()).collect();
        assert_eq!(ids, vec![third.as_str(), second.as_str()]);

        let rest = store.list_documents(Some("alice"), 2, 2).await?;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, first);
        assert_eq!(store.list_documents(None, 10, 0).await?.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn delete_cascades_and_enforces_owner() -> Result<(), StorageError> {
        let store = MemoryStore::new(2);
        let id = completed_document(&store, "alice", "math", vec![Some(vec![0.0, 1.0])]).await?;

        assert!(!store.delete_document(&id, Some("mallory")).await?);
        assert!(store.get_document(&id, Some("mallory")).await?.is_none());
        assert_eq!(store.count_chunks(&id).await?, 1);

        assert!(store.delete_document(&id, Some("alice")).await?);
        assert_eq!(store.count_chunks(&id).await?, 0);
        assert!(store.get_document(&id, None).await?.is_none());
        assert!(!store.delete_document(&id, None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn subjects_are_distinct_per_owner() -> Result<(), StorageError> {
        let store = MemoryStore::new(2);
        for subject in ["physics", "math", "physics"] {
            store
                .create_document(new_document("alice", subject, "a.pdf"))
                .await?;
        }
        store
            .create_document(new_document("bob", "biology", "b.pdf"))
            .await?;

        assert_eq!(store.list_subjects("alice").await?, vec!["math", "physics"]);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_round_trip_keeps_vectors_and_gaps() -> Result<(), StorageError> {
        let dir = tempdir()?;
        let path = dir.path().join("store.json");

        let store = MemoryStore::new(2);
        let id = completed_document(
            &store,
            "alice",
            "math",
            vec![Some(vec![0.6, 0.8]), None],
        )
        .await?;
        store.save(&path).await?;

        let reloaded = MemoryStore::open(&path, 2).await?;
        let document = reloaded.get_document(&id, Some("alice")).await?;
        assert_eq!(document.map(|document| document.total_chunks), Some(2));
        assert_eq!(
            reloaded
                .get_chunk(&format!("{id}-0"))
                .await?
                .and_then(|chunk| chunk.embedding),
            Some(vec![0.6, 0.8])
        );
        assert!(reloaded
            .get_chunk(&format!("{id}-1"))
            .await?
            .is_some_and(|chunk| chunk.embedding.is_none()));

        assert!(matches!(
            MemoryStore::open(&path, 3).await,
            Err(StorageError::DimensionMismatch { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn missing_snapshot_opens_empty() -> Result<(), StorageError> {
        let dir = tempdir()?;
        let store = MemoryStore::open(&dir.path().join("absent.json"), 4).await?;
        assert!(store.list_documents(None, 10, 0).await?.is_empty());
        Ok(())
    }
}
