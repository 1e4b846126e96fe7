use crate::error::ModelError;
use crate::llm::{GenerationParams, GenerationRequest, LanguageModel};
use crate::models::{RankedChunk, RetrievalResult, RetrievalScope};
use crate::question::{Difficulty, QuestionAnalysis, QuestionType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const FALLBACK_MODEL: &str = "fallback";
pub const NO_MODEL: &str = "none";

#[derive(Debug, Clone)]
pub struct ComposerOptions {
    /// Minimum similarity a chunk needs before a document-scoped answer may use it.
    pub strict_threshold: f32,
    pub min_relevant_chars: usize,
    pub max_prompt_chunks: usize,
    pub max_chunk_chars: usize,
    pub params: GenerationParams,
    pub model_timeout: Duration,
}

impl Default for ComposerOptions {
    fn default() -> Self {
        Self {
            strict_threshold: 0.4,
            min_relevant_chars: 50,
            max_prompt_chunks: 5,
            max_chunk_chars: 1_500,
            params: GenerationParams::default(),
            model_timeout: Duration::from_secs(60),
        }
    }
}

/// Model names for the lighter and the heavier tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTiers {
    pub standard: String,
    pub advanced: String,
}

impl ModelTiers {
    pub fn select(&self, analysis: &QuestionAnalysis) -> &str {
        let heavy = analysis.difficulty == Difficulty::Advanced
            || matches!(
                analysis.question_type,
                QuestionType::Problem | QuestionType::Procedural
            );
        if heavy {
            &self.advanced
        } else {
            &self.standard
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStyle {
    Visual,
    Auditory,
    Reading,
    Kinesthetic,
}

impl LearningStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Visual => "visual",
            Self::Auditory => "auditory",
            Self::Reading => "reading",
            Self::Kinesthetic => "kinesthetic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub learning_style: LearningStyle,
}

/// How the answer relates to the retrieved material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grounding {
    /// Answered only from one document's chunks.
    Document,
    /// Answered from retrieved chunks, possibly supplemented and labeled.
    Context,
    /// Nothing was retrieved; answered from general knowledge with a disclaimer.
    GeneralKnowledge,
    /// Templated reply, the document holds nothing relevant.
    NotFoundInDocument,
    Fallback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: String,
    pub title: String,
    pub page: u32,
    pub relevance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedAnswer {
    pub text: String,
    pub model_used: String,
    pub token_usage: TokenUsage,
    pub confidence: f32,
    pub sources_used: Vec<SourceRef>,
    pub grounding: Grounding,
}

impl ComposedAnswer {
    pub fn fallback(question: &str) -> Self {
        Self {
            text: format!(
                "I'm currently unable to process your question: '{question}'. \
                 Please check the AI service configuration."
            ),
            model_used: FALLBACK_MODEL.to_string(),
            token_usage: TokenUsage::default(),
            confidence: 0.0,
            sources_used: Vec::new(),
            grounding: Grounding::Fallback,
        }
    }

    fn not_found_in_document(question: &str, document_name: &str) -> Self {
        Self {
            text: format!(
                "The document \"{document_name}\" does not appear to contain information \
                 that answers this question: '{question}'.\n\n\
                 Try rephrasing the question with terms used in the document, \
                 or ask without selecting a document to search all of your materials."
            ),
            model_used: NO_MODEL.to_string(),
            token_usage: TokenUsage::default(),
            confidence: 0.0,
            sources_used: Vec::new(),
            grounding: Grounding::NotFoundInDocument,
        }
    }
}

/// Turns a question and its retrieved context into an answer.
pub struct AnswerComposer {
    model: Arc<dyn LanguageModel>,
    tiers: ModelTiers,
    options: ComposerOptions,
}

impl AnswerComposer {
    pub fn new(model: Arc<dyn LanguageModel>, tiers: ModelTiers, options: ComposerOptions) -> Self {
        Self {
            model,
            tiers,
            options,
        }
    }

    /// Never fails: provider errors and timeouts become
    /// [`ComposedAnswer::fallback`], and a document-scoped question with no
    /// sufficiently relevant chunk gets a templated reply without a model call.
    pub async fn compose(
        &self,
        analysis: &QuestionAnalysis,
        context: &RetrievalResult,
        preferences: Option<&UserPreferences>,
    ) -> ComposedAnswer {
        let (chunks, grounding) = match &context.scope {
            RetrievalScope::Document { document_name, .. } => {
                let relevant: Vec<&RankedChunk> = context
                    .chunks
                    .iter()
                    .filter(|chunk| self.is_strictly_relevant(chunk))
                    .collect();
                if relevant.is_empty() {
                    info!(
                        document_name = %document_name,
                        candidates = context.chunks.len(),
                        "no chunk passed the strict threshold, answering with not-found template"
                    );
                    return ComposedAnswer::not_found_in_document(&analysis.text, document_name);
                }
                (relevant, Grounding::Document)
            }
            RetrievalScope::General if context.chunks.is_empty() => {
                (Vec::new(), Grounding::GeneralKnowledge)
            }
            RetrievalScope::General => (context.chunks.iter().collect(), Grounding::Context),
        };
        let chunks: Vec<&RankedChunk> = chunks
            .into_iter()
            .take(self.options.max_prompt_chunks)
            .collect();

        if !self.model.is_available() {
            warn!(
                model = self.model.name(),
                "language model unavailable, returning fallback answer"
            );
            return ComposedAnswer::fallback(&analysis.text);
        }

        let model = self.tiers.select(analysis).to_string();
        let request = GenerationRequest {
            model: model.clone(),
            system: system_prompt(analysis, preferences, grounding),
            prompt: self.user_prompt(analysis, &chunks, grounding, &context.scope),
            params: self.options.params,
        };

        let timeout = self.options.model_timeout;
        let generated = match tokio::time::timeout(timeout, self.model.generate(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout(timeout)),
        };

        match generated {
            Ok(generation) => {
                info!(
                    model = %model,
                    prompt_tokens = generation.prompt_tokens,
                    completion_tokens = generation.completion_tokens,
                    chunks = chunks.len(),
                    "answer generated"
                );
                ComposedAnswer {
                    text: generation.text,
                    model_used: model,
                    token_usage: TokenUsage {
                        prompt_tokens: generation.prompt_tokens,
                        completion_tokens: generation.completion_tokens,
                        total_tokens: generation.prompt_tokens + generation.completion_tokens,
                    },
                    confidence: confidence(analysis, &chunks),
                    sources_used: sources(&chunks),
                    grounding,
                }
            }
            Err(err) => {
                error!(model = %model, error = %err, "answer generation failed");
                ComposedAnswer::fallback(&analysis.text)
            }
        }
    }

    fn is_strictly_relevant(&self, chunk: &RankedChunk) -> bool {
        chunk.matched.similarity >= self.options.strict_threshold
            && chunk.matched.content.trim().chars().count() >= self.options.min_relevant_chars
    }

    fn user_prompt(
        &self,
        analysis: &QuestionAnalysis,
        chunks: &[&RankedChunk],
        grounding: Grounding,
        scope: &RetrievalScope,
    ) -> String {
        let mut prompt = format!("STUDENT QUESTION:\n{}\n\n", analysis.text);
        let _ = writeln!(
            prompt,
            "QUESTION ANALYSIS: type={}, difficulty={}, subject={}\n",
            analysis.question_type.as_str(),
            analysis.difficulty.as_str(),
            analysis.subject.as_deref().unwrap_or("unknown"),
        );

        if chunks.is_empty() {
            prompt.push_str(
                "No specific context material was found. Answer from general knowledge and \
                 begin by stating that the answer is not based on the student's materials.",
            );
        } else {
            match scope {
                RetrievalScope::Document { document_name, .. } => {
                    let _ = writeln!(prompt, "CONTEXT FROM THE DOCUMENT \"{document_name}\":");
                }
                RetrievalScope::General => {
                    prompt.push_str("RELEVANT CONTEXT FROM STUDY MATERIALS:\n");
                }
            }
            for (position, chunk) in chunks.iter().enumerate() {
                let content: String = chunk
                    .matched
                    .content
                    .chars()
                    .take(self.options.max_chunk_chars)
                    .collect();
                let _ = write!(
                    prompt,
                    "\n[Source {}: {}, Page {}, similarity {:.2}]\n{}\n",
                    position + 1,
                    chunk.matched.document_name,
                    chunk.matched.page_number,
                    chunk.matched.similarity,
                    content
                );
            }
            if grounding == Grounding::Document {
                prompt.push_str(
                    "\nAnswer only from the context above and cite the pages you use. \
                     If the context does not cover part of the question, \
                     say so instead of guessing.",
                );
            } else {
                prompt.push_str(
                    "\nBase your answer on the context above and cite your sources. \
                     You may add general knowledge where the context is incomplete, \
                     but label it clearly as general knowledge.",
                );
            }
        }

        if analysis.requires_calculation {
            prompt.push_str(
                "\n\nNote: This question requires mathematical calculations. \
                 Please show your work step-by-step.",
            );
        }
        if analysis.requires_visual {
            prompt.push_str(
                "\n\nNote: Consider describing visual elements, diagrams, or graphs \
                 that would help explain this concept.",
            );
        }
        prompt
    }
}

fn system_prompt(
    analysis: &QuestionAnalysis,
    preferences: Option<&UserPreferences>,
    grounding: Grounding,
) -> String {
    let subject = analysis.subject.as_deref().unwrap_or("general studies");
    let difficulty = analysis.difficulty.as_str();
    let mut prompt = format!(
        "You are an expert tutor specializing in {subject}. Give clear, accurate and helpful \
         educational answers, adapted to a {difficulty} level student.\n\n\
         Structure every answer with these sections:\n\
         1. Direct answer\n\
         2. Explanation\n\
         3. Examples\n\
         4. Process (when the question involves one)\n\
         5. Citations from the provided material\n\
         6. Limitations\n\n\
         QUESTION TYPE: {}",
        analysis.question_type.as_str()
    );

    let style_lines = match analysis.question_type {
        QuestionType::Problem => {
            "\n- Show the solution step by step\n- Explain the reasoning behind each step"
        }
        QuestionType::Conceptual => {
            "\n- Focus on understanding and connections\n- Use analogies to clarify complex ideas"
        }
        QuestionType::Factual => {
            "\n- Provide accurate, concise information\n- Include relevant background"
        }
        QuestionType::Procedural => {
            "\n- Break the process into clear steps\n- Explain when to use this procedure"
        }
        QuestionType::Verification => {
            "\n- Check the student's work carefully\n\
             - Point out exactly where it goes wrong, if anywhere"
        }
    };
    prompt.push_str(style_lines);

    if grounding == Grounding::Document {
        prompt.push_str(
            "\n\nThe student asked about one specific document. Do not use outside knowledge.",
        );
    }

    if let Some(preferences) = preferences {
        let _ = write!(
            prompt,
            "\n\nUSER PREFERENCES:\n- Learning style: {}",
            preferences.learning_style.as_str()
        );
        if preferences.learning_style == LearningStyle::Visual {
            prompt.push_str("\n- Include descriptions of diagrams or visual elements when helpful");
        }
    }
    prompt
}

/// 0.5 base, raised by up to 0.4 with average similarity of the chunks used,
/// shifted by difficulty and by a detected subject.
pub fn confidence(analysis: &QuestionAnalysis, chunks: &[&RankedChunk]) -> f32 {
    let mut score = 0.5;
    if !chunks.is_empty() {
        let average = chunks
            .iter()
            .map(|chunk| chunk.matched.similarity)
            .sum::<f32>()
            / chunks.len() as f32;
        score += average * 0.4;
    }
    match analysis.difficulty {
        Difficulty::Beginner => score += 0.1,
        Difficulty::Advanced => score -= 0.1,
        Difficulty::Intermediate => {}
    }
    if analysis.subject.is_some() {
        score += 0.1;
    }
    score.clamp(0.0, 1.0)
}

fn sources(chunks: &[&RankedChunk]) -> Vec<SourceRef> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter(|chunk| seen.insert((chunk.matched.document_id.clone(), chunk.matched.page_number)))
        .map(|chunk| SourceRef {
            document_id: chunk.matched.document_id.clone(),
            title: chunk.matched.document_name.clone(),
            page: chunk.matched.page_number,
            relevance: chunk.matched.similarity,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Generation;
    use crate::models::{ChunkMatch, ContextSummary, SearchStrategy};
    use crate::question::Intent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedModel {
        reply: Option<String>,
        delay: Duration,
        calls: AtomicUsize,
        last: Mutex<Option<GenerationRequest>>,
    }

    impl ScriptedModel {
        fn replying(text: &str) -> Self {
            Self {
                reply: Some(text.to_string()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
            }
        }

        fn failing() -> Self {
            Self {
                reply: None,
                ..Self::replying("")
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().expect("lock") = Some(request.clone());
            tokio::time::sleep(self.delay).await;
            match &self.reply {
                Some(text) => Ok(Generation {
                    text: text.clone(),
                    prompt_tokens: 10,
                    completion_tokens: 5,
                }),
                None => Err(ModelError::BackendResponse {
                    backend: "scripted".to_string(),
                    details: "quota exceeded: secret-account-123".to_string(),
                }),
            }
        }
    }

    fn analysis(
        question_type: QuestionType,
        difficulty: Difficulty,
        subject: Option<&str>,
    ) -> QuestionAnalysis {
        QuestionAnalysis {
            text: "What is torque?".to_string(),
            question_type,
            difficulty,
            subject: subject.map(str::to_string),
            keywords: vec!["torque".to_string()],
            intent: Intent::Explanation,
            requires_calculation: false,
            requires_visual: false,
        }
    }

    fn ranked(similarity: f32, page: u32, content: &str) -> RankedChunk {
        RankedChunk {
            matched: ChunkMatch {
                chunk_id: format!("c{page}-{similarity}"),
                document_id: "doc-1".to_string(),
                document_name: "mechanics.pdf".to_string(),
                subject: "physics".to_string(),
                chunk_index: page,
                page_number: page,
                content: content.to_string(),
                similarity,
            },
            relevance: similarity,
        }
    }

    fn context(scope: RetrievalScope, chunks: Vec<RankedChunk>) -> RetrievalResult {
        RetrievalResult {
            total_found: chunks.len(),
            chunks,
            strategies_used: vec![SearchStrategy::VectorSimilarity],
            failed_strategies: Vec::new(),
            scope,
            summary: ContextSummary::default(),
        }
    }

    fn document_scope() -> RetrievalScope {
        RetrievalScope::Document {
            document_id: "doc-1".to_string(),
            document_name: "mechanics.pdf".to_string(),
        }
    }

    fn tiers() -> ModelTiers {
        ModelTiers {
            standard: "light".to_string(),
            advanced: "heavy".to_string(),
        }
    }

    fn composer(model: Arc<ScriptedModel>) -> AnswerComposer {
        AnswerComposer::new(model, tiers(), ComposerOptions::default())
    }

    const LONG: &str =
        "Torque is the rotational equivalent of force, equal to force times lever arm.";

    #[tokio::test]
    async fn weak_document_context_short_circuits_without_calling_the_model() {
        let model = Arc::new(ScriptedModel::replying("should not be used"));
        let question = analysis(QuestionType::Factual, Difficulty::Intermediate, None);

        let answer = composer(model.clone())
            .compose(&question, &context(document_scope(), vec![ranked(0.35, 2, LONG)]), None)
            .await;

        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(answer.grounding, Grounding::NotFoundInDocument);
        assert!(answer.text.contains("does not appear to contain"));
        assert!(answer.text.contains("mechanics.pdf"));
        assert!(answer.sources_used.is_empty());
    }

    #[tokio::test]
    async fn short_chunks_do_not_count_as_relevant() {
        let model = Arc::new(ScriptedModel::replying("unused"));
        let question = analysis(QuestionType::Factual, Difficulty::Intermediate, None);

        let answer = composer(model.clone())
            .compose(&question, &context(document_scope(), vec![ranked(0.9, 1, "Torque.")]), None)
            .await;

        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(answer.grounding, Grounding::NotFoundInDocument);
    }

    #[tokio::test]
    async fn document_answer_uses_only_strict_chunks() {
        let model = Arc::new(ScriptedModel::replying("Torque is force times lever arm."));
        let question = analysis(QuestionType::Factual, Difficulty::Intermediate, Some("physics"));
        let chunks = vec![
            ranked(0.8, 3, LONG),
            ranked(0.3, 4, "Weakly related text about gears and their teeth count."),
        ];

        let answer = composer(model.clone())
            .compose(&question, &context(document_scope(), chunks), None)
            .await;

        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(answer.grounding, Grounding::Document);
        assert_eq!(answer.model_used, "light");
        assert_eq!(answer.token_usage.total_tokens, 15);
        assert_eq!(answer.sources_used.len(), 1);
        assert_eq!(answer.sources_used[0].page, 3);
        let request = model.last.lock().expect("lock").clone().expect("request recorded");
        assert!(request.prompt.contains("Page 3"));
        assert!(!request.prompt.contains("gears"));
    }

    #[tokio::test]
    async fn provider_errors_become_a_fallback_without_details() {
        let model = Arc::new(ScriptedModel::failing());
        let question = analysis(QuestionType::Conceptual, Difficulty::Intermediate, None);

        let answer = composer(model)
            .compose(&question, &context(RetrievalScope::General, vec![ranked(0.8, 1, LONG)]), None)
            .await;

        assert_eq!(answer.model_used, FALLBACK_MODEL);
        assert_eq!(answer.confidence, 0.0);
        assert!(answer.sources_used.is_empty());
        assert!(answer.text.contains("What is torque?"));
        assert!(!answer.text.contains("secret-account-123"));
    }

    #[tokio::test]
    async fn slow_model_times_out_into_fallback() {
        let model = Arc::new(ScriptedModel {
            delay: Duration::from_millis(200),
            ..ScriptedModel::replying("late")
        });
        let options = ComposerOptions {
            model_timeout: Duration::from_millis(20),
            ..ComposerOptions::default()
        };
        let composer = AnswerComposer::new(model, tiers(), options);

        let answer = composer
            .compose(
                &analysis(QuestionType::Factual, Difficulty::Beginner, None),
                &context(RetrievalScope::General, Vec::new()),
                None,
            )
            .await;

        assert_eq!(answer.grounding, Grounding::Fallback);
    }

    #[tokio::test]
    async fn empty_general_context_asks_for_a_disclaimer() {
        let model = Arc::new(ScriptedModel::replying("Generally speaking..."));
        let question = analysis(QuestionType::Conceptual, Difficulty::Intermediate, None);
        let preferences = UserPreferences {
            learning_style: LearningStyle::Visual,
        };

        let answer = composer(model.clone())
            .compose(&question, &context(RetrievalScope::General, Vec::new()), Some(&preferences))
            .await;

        assert_eq!(answer.grounding, Grounding::GeneralKnowledge);
        assert!((answer.confidence - 0.5).abs() < 1e-6);
        let request = model.last.lock().expect("lock").clone().expect("request recorded");
        assert!(request.prompt.contains("general knowledge"));
        assert!(request.system.contains("Learning style: visual"));
        assert!(request.system.contains("diagrams"));
    }

    #[test]
    fn heavier_tier_for_advanced_problem_and_procedural_questions() {
        let tiers = tiers();
        assert_eq!(
            tiers.select(&analysis(QuestionType::Factual, Difficulty::Beginner, None)),
            "light"
        );
        assert_eq!(
            tiers.select(&analysis(QuestionType::Factual, Difficulty::Advanced, None)),
            "heavy"
        );
        assert_eq!(
            tiers.select(&analysis(QuestionType::Problem, Difficulty::Beginner, None)),
            "heavy"
        );
        assert_eq!(
            tiers.select(&analysis(QuestionType::Procedural, Difficulty::Intermediate, None)),
            "heavy"
        );
    }

    #[test]
    fn confidence_is_clamped() {
        let strong = ranked(1.0, 1, LONG);
        let chunks = vec![&strong];
        let question = analysis(QuestionType::Factual, Difficulty::Beginner, Some("physics"));
        let high = confidence(&question, &chunks);
        assert_eq!(high, 1.0);

        let low = confidence(&analysis(QuestionType::Factual, Difficulty::Advanced, None), &[]);
        assert!((low - 0.4).abs() < 1e-6);
    }

    #[test]
    fn sources_are_deduplicated_by_document_and_page() {
        let first = ranked(0.9, 1, LONG);
        let same_page = ranked(0.7, 1, LONG);
        let other_page = ranked(0.6, 2, LONG);

        let refs = sources(&[&first, &same_page, &other_page]);

        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].relevance, 0.9);
    }
}
