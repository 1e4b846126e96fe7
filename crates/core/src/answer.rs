use crate::composer::{
    AnswerComposer, ComposedAnswer, Grounding, SourceRef, TokenUsage, UserPreferences,
};
use crate::models::{
    ContextSummary, FailureDetail, FailureStage, RetrievalResult, RetrievalScope, SearchStrategy,
};
use crate::question::{Difficulty, QuestionAnalysis, QuestionClassifier, QuestionType, UserContext};
use crate::retriever::ContextRetriever;
use crate::traits::DocumentStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_RELATED_QUESTIONS: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct QuestionRequest {
    pub text: String,
    pub owner_id: String,
    pub document_id: Option<String>,
    pub session_id: Option<String>,
    pub preferences: Option<UserPreferences>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerSections {
    pub response_text: String,
    pub quick_answer: String,
    pub detailed_explanation: String,
    pub examples: String,
    pub step_by_step: Vec<String>,
    pub citations: String,
    pub limitations: String,
    pub model_used: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerSources {
    pub primary_sources: Vec<SourceRef>,
    pub context_summary: ContextSummary,
    pub search_strategies: Vec<SearchStrategy>,
    pub total_found: usize,
    pub scope: RetrievalScope,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerMetadata {
    pub confidence: f32,
    pub question_type: Option<QuestionType>,
    pub difficulty: Option<Difficulty>,
    pub subject: Option<String>,
    pub model_used: String,
    pub token_usage: TokenUsage,
    pub grounding: Grounding,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NextSteps {
    pub related_questions: Vec<String>,
    pub practice_suggestions: Vec<String>,
    pub further_reading: Vec<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub success: bool,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub question: String,
    pub analysis: Option<QuestionAnalysis>,
    pub answer: AnswerSections,
    pub sources: AnswerSources,
    pub metadata: AnswerMetadata,
    pub next_steps: NextSteps,
    pub error: Option<FailureDetail>,
}

/// Answers questions end to end: classify, retrieve, compose, format.
pub struct QuestionService {
    classifier: Arc<dyn QuestionClassifier>,
    retriever: ContextRetriever,
    composer: AnswerComposer,
    store: Arc<dyn DocumentStore>,
}

impl QuestionService {
    pub fn new(
        classifier: Arc<dyn QuestionClassifier>,
        retriever: ContextRetriever,
        composer: AnswerComposer,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            classifier,
            retriever,
            composer,
            store,
        }
    }

    /// Classifies a question against the owner's subjects without answering it.
    pub async fn analyze(&self, text: &str, owner_id: &str) -> QuestionAnalysis {
        let context = self.user_context(owner_id).await;
        self.classifier.analyze(text, &context)
    }

    async fn user_context(&self, owner_id: &str) -> UserContext {
        match self.store.list_subjects(owner_id).await {
            Ok(subjects) => UserContext { subjects },
            Err(error) => {
                warn!(owner_id, %error, "could not load subjects, classifying without them");
                UserContext::default()
            }
        }
    }

    /// Never returns `Err`; every failure is a response with `success == false`.
    pub async fn answer_question(&self, request: QuestionRequest) -> AnswerResponse {
        let session_id = request
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let question = request.text.trim().to_string();

        if question.is_empty() {
            return failure(
                session_id,
                &question,
                None,
                FailureDetail::new(FailureStage::Validation, "question must not be empty"),
            );
        }
        if request.owner_id.trim().is_empty() {
            return failure(
                session_id,
                &question,
                None,
                FailureDetail::new(FailureStage::Validation, "owner id must not be empty"),
            );
        }

        let analysis = self.analyze(&question, &request.owner_id).await;
        let max_chunks = self.retriever.options().max_chunks;

        let retrieved = match request.document_id.as_deref() {
            Some(document_id) => {
                let document = match self
                    .store
                    .get_document(document_id, Some(&request.owner_id))
                    .await
                {
                    Ok(Some(document)) => document,
                    Ok(None) => {
                        warn!(
                            document_id,
                            owner_id = %request.owner_id,
                            "document not found for owner"
                        );
                        return failure(
                            session_id,
                            &question,
                            Some(analysis),
                            FailureDetail::new(FailureStage::Validation, "document not found"),
                        );
                    }
                    Err(error) => {
                        warn!(document_id, %error, "document lookup failed");
                        return failure(
                            session_id,
                            &question,
                            Some(analysis),
                            FailureDetail::new(
                                FailureStage::Storage,
                                "could not load the document",
                            ),
                        );
                    }
                };
                self.retriever
                    .retrieve_in_document(&analysis, &document, max_chunks)
                    .await
            }
            None => {
                self.retriever
                    .retrieve(&analysis, &request.owner_id, max_chunks)
                    .await
            }
        };

        let context = match retrieved {
            Ok(context) => context,
            Err(error) => {
                warn!(session_id = %session_id, %error, "context retrieval failed");
                return failure(
                    session_id,
                    &question,
                    Some(analysis),
                    FailureDetail::new(FailureStage::Retrieval, "could not search your documents"),
                );
            }
        };

        let composed = self
            .composer
            .compose(&analysis, &context, request.preferences.as_ref())
            .await;
        let error = (composed.grounding == Grounding::Fallback).then(|| {
            FailureDetail::new(FailureStage::Model, "the answer service is unavailable right now")
        });

        info!(
            session_id = %session_id,
            total_found = context.total_found,
            confidence = composed.confidence,
            model = %composed.model_used,
            "question answered"
        );

        format_response(session_id, question, analysis, context, composed, error)
    }
}

fn format_response(
    session_id: String,
    question: String,
    analysis: QuestionAnalysis,
    context: RetrievalResult,
    composed: ComposedAnswer,
    error: Option<FailureDetail>,
) -> AnswerResponse {
    let next_steps = NextSteps {
        related_questions: related_questions(&analysis),
        practice_suggestions: practice_suggestions(analysis.question_type),
        further_reading: further_reading(&context.summary),
    };

    AnswerResponse {
        success: error.is_none(),
        session_id,
        timestamp: Utc::now(),
        question,
        answer: parse_sections(&composed.text, &composed.model_used),
        sources: AnswerSources {
            primary_sources: composed.sources_used,
            context_summary: context.summary,
            search_strategies: context.strategies_used,
            total_found: context.total_found,
            scope: context.scope,
        },
        metadata: AnswerMetadata {
            confidence: composed.confidence,
            question_type: Some(analysis.question_type),
            difficulty: Some(analysis.difficulty),
            subject: analysis.subject.clone(),
            model_used: composed.model_used,
            token_usage: composed.token_usage,
            grounding: composed.grounding,
        },
        analysis: Some(analysis),
        next_steps,
        error,
    }
}

fn failure(
    session_id: String,
    question: &str,
    analysis: Option<QuestionAnalysis>,
    error: FailureDetail,
) -> AnswerResponse {
    let fallback = ComposedAnswer::fallback(question);
    AnswerResponse {
        success: false,
        session_id,
        timestamp: Utc::now(),
        question: question.to_string(),
        answer: AnswerSections {
            response_text: fallback.text.clone(),
            quick_answer: "I'm having trouble processing your question right now.".to_string(),
            detailed_explanation: fallback.text,
            model_used: fallback.model_used.clone(),
            ..AnswerSections::default()
        },
        sources: AnswerSources {
            primary_sources: Vec::new(),
            context_summary: ContextSummary::default(),
            search_strategies: Vec::new(),
            total_found: 0,
            scope: RetrievalScope::General,
        },
        metadata: AnswerMetadata {
            confidence: 0.0,
            question_type: analysis.as_ref().map(|analysis| analysis.question_type),
            difficulty: analysis.as_ref().map(|analysis| analysis.difficulty),
            subject: analysis.as_ref().and_then(|analysis| analysis.subject.clone()),
            model_used: fallback.model_used,
            token_usage: TokenUsage::default(),
            grounding: Grounding::Fallback,
        },
        analysis,
        next_steps: NextSteps {
            related_questions: vec!["Try asking a simpler version of this question".to_string()],
            practice_suggestions: vec!["Review your study materials".to_string()],
            further_reading: Vec::new(),
        },
        error: Some(error),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Quick,
    Explanation,
    Examples,
    Steps,
    Citations,
    Limitations,
}

/// Recognizes a section heading such as `## 2. Explanation` or
/// `**Direct answer:** text`, returning the section and any text after it.
fn section_heading(line: &str) -> Option<(Section, &str)> {
    let stripped = line.trim_start_matches(|c: char| {
        c == '#' || c == '*' || c == '.' || c == ')' || c.is_ascii_digit() || c.is_whitespace()
    });
    let (label, rest) = match stripped.split_once(':') {
        Some((label, rest)) => (label, rest),
        None => (stripped, ""),
    };
    let label = label.trim_matches(|c: char| c == '*' || c.is_whitespace()).to_lowercase();
    let section = match label.as_str() {
        "direct answer" | "quick answer" | "answer" => Section::Quick,
        "explanation" | "detailed explanation" => Section::Explanation,
        "example" | "examples" => Section::Examples,
        "process" | "steps" | "step-by-step" | "step by step" | "solution steps" => Section::Steps,
        "citations" | "sources" => Section::Citations,
        "limitations" => Section::Limitations,
        _ => return None,
    };
    Some((section, rest.trim_start_matches('*').trim()))
}

/// Splits model output into the sections the system prompt asks for.
/// Text before any heading counts as explanation; without a direct answer
/// section the first sentence of the explanation stands in.
pub fn parse_sections(text: &str, model_used: &str) -> AnswerSections {
    let mut buckets: Vec<(Section, Vec<String>)> = Vec::new();
    let mut current = Section::Explanation;

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some((section, rest)) = section_heading(line) {
            current = section;
            if !rest.is_empty() {
                push_line(&mut buckets, current, rest);
            }
        } else {
            push_line(&mut buckets, current, line);
        }
    }

    let joined = |section: Section| {
        buckets
            .iter()
            .find(|(bucket, _)| *bucket == section)
            .map(|(_, lines)| lines.join("\n"))
            .unwrap_or_default()
    };

    let explanation = joined(Section::Explanation);
    let mut quick_answer = joined(Section::Quick);
    if quick_answer.is_empty() {
        quick_answer = first_sentence(&explanation);
    }
    let step_by_step = buckets
        .iter()
        .find(|(bucket, _)| *bucket == Section::Steps)
        .map(|(_, lines)| lines.clone())
        .unwrap_or_default();

    AnswerSections {
        response_text: text.to_string(),
        quick_answer,
        detailed_explanation: if explanation.is_empty() {
            text.trim().to_string()
        } else {
            explanation
        },
        examples: joined(Section::Examples),
        step_by_step,
        citations: joined(Section::Citations),
        limitations: joined(Section::Limitations),
        model_used: model_used.to_string(),
    }
}

fn push_line(buckets: &mut Vec<(Section, Vec<String>)>, section: Section, line: &str) {
    match buckets.iter_mut().find(|(bucket, _)| *bucket == section) {
        Some((_, lines)) => lines.push(line.to_string()),
        None => buckets.push((section, vec![line.to_string()])),
    }
}

fn first_sentence(text: &str) -> String {
    match text.split_once(". ") {
        Some((sentence, _)) => format!("{sentence}."),
        None => text.lines().next().unwrap_or_default().to_string(),
    }
}

pub fn related_questions(analysis: &QuestionAnalysis) -> Vec<String> {
    let mut questions = Vec::new();
    if let Some(keyword) = analysis.keywords.first() {
        questions.push(format!("What are the applications of {keyword}?"));
        questions.push(format!("How does {keyword} relate to other concepts?"));
        questions.push(format!("What are common mistakes when working with {keyword}?"));
    }
    if let Some(subject) = analysis.subject.as_deref() {
        questions.push(format!("What are the fundamentals of {subject} I should know?"));
        questions.push(format!("What are advanced topics in {subject}?"));
    }
    questions.truncate(MAX_RELATED_QUESTIONS);
    questions
}

pub fn practice_suggestions(question_type: QuestionType) -> Vec<String> {
    let suggestions: &[&str] = match question_type {
        QuestionType::Problem => &[
            "Practice similar problems with different values",
            "Try solving without looking at the solution first",
            "Work through the problem step-by-step on paper",
        ],
        QuestionType::Conceptual => &[
            "Create concept maps to connect related ideas",
            "Explain the concept to someone else",
            "Find real-world examples of this concept",
        ],
        QuestionType::Procedural => &[
            "Practice the procedure with different examples",
            "Create a checklist of steps to follow",
            "Time yourself to improve efficiency",
        ],
        QuestionType::Factual | QuestionType::Verification => &[],
    };
    suggestions.iter().map(|suggestion| suggestion.to_string()).collect()
}

pub fn further_reading(summary: &ContextSummary) -> Vec<String> {
    summary
        .sources
        .iter()
        .take(3)
        .map(|source| format!("Review more sections from {source}"))
        .chain(
            summary
                .topics
                .iter()
                .take(2)
                .map(|topic| format!("Explore more about {topic}")),
        )
        .collect()
}
