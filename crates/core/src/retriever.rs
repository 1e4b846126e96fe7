use crate::embeddings::EmbeddingEngine;
use crate::error::{RetrievalError, StorageError};
use crate::models::{
    ChunkMatch, ContextSummary, Document, RankedChunk, RankingWeights, RetrievalOptions,
    RetrievalResult, RetrievalScope, SearchStrategy,
};
use crate::question::{QuestionAnalysis, QuestionType};
use crate::traits::DocumentStore;
use futures::future::join_all;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_TOPICS: usize = 10;

/// Finds stored chunks relevant to a question and re-ranks them.
pub struct ContextRetriever {
    engine: Arc<EmbeddingEngine>,
    store: Arc<dyn DocumentStore>,
    options: RetrievalOptions,
}

impl ContextRetriever {
    pub fn new(
        engine: Arc<EmbeddingEngine>,
        store: Arc<dyn DocumentStore>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            engine,
            store,
            options,
        }
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    /// A zero vector stands in when the question cannot be embedded. It
    /// matches nothing, so the searches still run and come back empty.
    async fn query_vector(&self, text: &str) -> Vec<f32> {
        match self.engine.embed_one(text).await {
            Some(vector) => vector,
            None => {
                warn!("question embedding unavailable, searching with placeholder vector");
                vec![0.0; self.store.dimensions()]
            }
        }
    }

    /// Searches the detected subject first, then fills any shortfall from
    /// every subject the owner has. Zero matches is `Ok`; `Err` means every
    /// search that was attempted failed.
    pub async fn retrieve(
        &self,
        analysis: &QuestionAnalysis,
        owner_id: &str,
        max_chunks: usize,
    ) -> Result<RetrievalResult, RetrievalError> {
        let query = self.query_vector(&analysis.text).await;
        let mut collected: Vec<ChunkMatch> = Vec::new();
        let mut strategies_used = vec![SearchStrategy::VectorSimilarity];
        let mut failed_strategies = Vec::new();
        let mut errors = Vec::new();
        let mut attempted = 0;

        if let Some(subject) = analysis.subject.as_deref() {
            attempted += 1;
            match self
                .store
                .search_by_subject(
                    &query,
                    subject,
                    owner_id,
                    self.options.subject_threshold,
                    max_chunks,
                )
                .await
            {
                Ok(found) => {
                    debug!(subject, found = found.len(), "subject search finished");
                    collected.extend(found);
                    strategies_used.push(SearchStrategy::SubjectSpecific);
                }
                Err(error) => {
                    warn!(subject, %error, "subject search failed");
                    errors.push(format!("subject_specific: {error}"));
                    failed_strategies.push(SearchStrategy::SubjectSpecific);
                }
            }
        }

        if collected.len() < max_chunks {
            attempted += 1;
            let remaining = max_chunks - collected.len();
            match self.cross_subject(&query, owner_id, remaining, &collected).await {
                Ok(found) => {
                    debug!(found = found.len(), "cross-subject search finished");
                    collected.extend(found);
                    strategies_used.push(SearchStrategy::CrossSubject);
                }
                Err(error) => {
                    warn!(%error, "cross-subject search failed");
                    errors.push(format!("cross_subject: {error}"));
                    failed_strategies.push(SearchStrategy::CrossSubject);
                }
            }
        }

        if attempted > 0 && failed_strategies.len() == attempted {
            return Err(RetrievalError::AllStrategiesFailed(errors.join("; ")));
        }

        Ok(self.finish(
            collected,
            analysis,
            max_chunks,
            RetrievalScope::General,
            strategies_used,
            failed_strategies,
        ))
    }

    /// Searches a single document. The caller is responsible for checking
    /// that the asker owns it.
    pub async fn retrieve_in_document(
        &self,
        analysis: &QuestionAnalysis,
        document: &Document,
        max_chunks: usize,
    ) -> Result<RetrievalResult, RetrievalError> {
        let query = self.query_vector(&analysis.text).await;
        let found = self
            .store
            .search_within_document(
                &query,
                &document.id,
                self.options.document_threshold,
                max_chunks,
            )
            .await
            .map_err(|error| {
                warn!(document_id = %document.id, %error, "document search failed");
                RetrievalError::AllStrategiesFailed(format!("document_scoped: {error}"))
            })?;

        let scope = RetrievalScope::Document {
            document_id: document.id.clone(),
            document_name: document.original_filename.clone(),
        };
        Ok(self.finish(
            found,
            analysis,
            max_chunks,
            scope,
            vec![SearchStrategy::VectorSimilarity, SearchStrategy::DocumentScoped],
            Vec::new(),
        ))
    }

    /// A few matches per subject, all searched concurrently. Fails only
    /// when the subject listing fails or every per-subject search does.
    async fn cross_subject(
        &self,
        query: &[f32],
        owner_id: &str,
        remaining: usize,
        already: &[ChunkMatch],
    ) -> Result<Vec<ChunkMatch>, StorageError> {
        let subjects = self.store.list_subjects(owner_id).await?;
        if subjects.is_empty() {
            return Ok(Vec::new());
        }

        let searches = subjects.iter().map(|subject| {
            self.store.search_by_subject(
                query,
                subject,
                owner_id,
                self.options.cross_subject_threshold,
                self.options.per_subject_limit,
            )
        });
        let outcomes = join_all(searches).await;

        let mut seen: HashSet<String> = already
            .iter()
            .map(|found| found.chunk_id.clone())
            .collect();
        let mut merged = Vec::new();
        let mut last_error = None;
        let mut succeeded = 0;
        for (subject, outcome) in subjects.iter().zip(outcomes) {
            match outcome {
                Ok(found) => {
                    succeeded += 1;
                    merged.extend(
                        found
                            .into_iter()
                            .filter(|found| seen.insert(found.chunk_id.clone())),
                    );
                }
                Err(error) => {
                    warn!(subject = %subject, %error, "per-subject search failed");
                    last_error = Some(error);
                }
            }
        }

        if succeeded == 0 {
            if let Some(error) = last_error {
                return Err(error);
            }
        }

        merged.sort_by(|left, right| right.similarity.total_cmp(&left.similarity));
        merged.truncate(remaining);
        Ok(merged)
    }

    fn finish(
        &self,
        collected: Vec<ChunkMatch>,
        analysis: &QuestionAnalysis,
        max_chunks: usize,
        scope: RetrievalScope,
        strategies_used: Vec<SearchStrategy>,
        failed_strategies: Vec<SearchStrategy>,
    ) -> RetrievalResult {
        let total_found = collected.len();
        let mut chunks = rank_chunks(collected, analysis, &self.options.weights);
        chunks.truncate(max_chunks);
        let summary = summarize(&chunks);

        info!(
            total_found,
            returned = chunks.len(),
            document_scoped = scope.is_document(),
            "context retrieved"
        );

        RetrievalResult {
            chunks,
            total_found,
            strategies_used,
            failed_strategies,
            scope,
            summary,
        }
    }
}

fn type_indicators(question_type: QuestionType) -> &'static [&'static str] {
    match question_type {
        QuestionType::Factual => &["definition", "is defined as", "refers to"],
        QuestionType::Problem => &["solve", "solution", "calculate", "formula"],
        QuestionType::Conceptual => &["because", "reason", "principle", "concept"],
        QuestionType::Procedural => &["step", "method", "procedure", "process"],
        QuestionType::Verification => &[],
    }
}

/// Scores each match as its similarity plus a bonus per question keyword
/// found in the text and a bonus when the text reads like the question's
/// type. Relevance is derived from similarity alone, and ties are broken by
/// position in the source, so ranking an already ranked list is a no-op.
pub fn rank_chunks(
    matches: Vec<ChunkMatch>,
    analysis: &QuestionAnalysis,
    weights: &RankingWeights,
) -> Vec<RankedChunk> {
    let keywords: BTreeSet<String> = analysis
        .keywords
        .iter()
        .map(|keyword| keyword.to_lowercase())
        .collect();
    let indicators = type_indicators(analysis.question_type);

    let mut ranked: Vec<RankedChunk> = matches
        .into_iter()
        .map(|matched| {
            let content = matched.content.to_lowercase();
            let keyword_hits = keywords
                .iter()
                .filter(|keyword| content.contains(keyword.as_str()))
                .count();
            let mut relevance = matched.similarity + weights.keyword_bonus * keyword_hits as f32;
            if indicators.iter().any(|indicator| content.contains(indicator)) {
                relevance += weights.type_match_bonus;
            }
            RankedChunk { matched, relevance }
        })
        .collect();

    ranked.sort_by(|left, right| {
        right
            .relevance
            .total_cmp(&left.relevance)
            .then_with(|| right.matched.similarity.total_cmp(&left.matched.similarity))
            .then_with(|| left.matched.document_id.cmp(&right.matched.document_id))
            .then_with(|| left.matched.chunk_index.cmp(&right.matched.chunk_index))
            .then_with(|| left.matched.chunk_id.cmp(&right.matched.chunk_id))
    });
    ranked
}

pub fn summarize(chunks: &[RankedChunk]) -> ContextSummary {
    if chunks.is_empty() {
        return ContextSummary::default();
    }

    let mut sources: Vec<String> = Vec::new();
    for chunk in chunks {
        if !sources.contains(&chunk.matched.document_name) {
            sources.push(chunk.matched.document_name.clone());
        }
    }

    let combined = chunks
        .iter()
        .map(|chunk| chunk.matched.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let avg_similarity =
        chunks.iter().map(|chunk| chunk.matched.similarity).sum::<f32>() / chunks.len() as f32;

    ContextSummary {
        total_chunks: chunks.len(),
        sources,
        topics: extract_topics(&combined),
        avg_similarity,
    }
}

/// Capitalized words and runs of capitalized words, first occurrence first.
fn extract_topics(content: &str) -> Vec<String> {
    let Ok(pattern) = Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b") else {
        return Vec::new();
    };

    let mut topics: Vec<String> = Vec::new();
    for found in pattern.find_iter(content) {
        let topic = found.as_str();
        if topic.len() > 3 && !topics.iter().any(|existing| existing == topic) {
            topics.push(topic.to_string());
            if topics.len() == MAX_TOPICS {
                break;
            }
        }
    }
    topics
}
