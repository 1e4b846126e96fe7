use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use pdf_tutor_core::{
    processing_stats, AnswerComposer, CharacterNgramEmbedder, ComposerOptions, ContextRetriever,
    DisabledEmbedder, DisabledModel, DocumentStore, EmbeddingEngine, EmbeddingOptions,
    EmbeddingProvider, ExtractionOptions, GeminiModel, IngestionPipeline, KeywordClassifier,
    LanguageModel, LearningStyle, MemoryStore, ModelTiers, OpenAiChatModel, OpenAiEmbedder,
    QuestionClassifier, QuestionRequest, QuestionService, RetrievalOptions, TextExtractor,
    UserContext, UserPreferences, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_GEMINI_BASE_URL,
    DEFAULT_OPENAI_BASE_URL,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-tutor", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON snapshot holding documents, chunks and vectors
    #[arg(long, env = "PDF_TUTOR_STORE", default_value = "pdf-tutor-store.json")]
    store: PathBuf,

    /// Embedding backend
    #[arg(long, env = "EMBEDDING_PROVIDER", value_enum, default_value_t = EmbeddingBackend::Local)]
    embedding_provider: EmbeddingBackend,

    /// Vector length shared by the embedding backend and the store
    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Embedding model name for remote backends
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    openai_api_key: String,

    /// OpenAI-compatible base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    openai_base_url: String,

    /// Language model backend
    #[arg(long, env = "LLM_PROVIDER", value_enum, default_value_t = ModelBackend::Gemini)]
    llm_provider: ModelBackend,

    /// Model for everyday questions
    #[arg(long, env = "LLM_MODEL")]
    llm_model: Option<String>,

    /// Model for advanced, problem and procedural questions
    #[arg(long, env = "LLM_ADVANCED_MODEL")]
    llm_advanced_model: Option<String>,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", default_value = "", hide_env_values = true)]
    gemini_api_key: String,

    /// Gemini base URL
    #[arg(long, default_value = DEFAULT_GEMINI_BASE_URL)]
    gemini_base_url: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum EmbeddingBackend {
    Local,
    Openai,
    Disabled,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelBackend {
    Openai,
    Gemini,
    Disabled,
}

#[derive(Clone, Copy, ValueEnum)]
enum Style {
    Visual,
    Auditory,
    Reading,
    Kinesthetic,
}

impl From<Style> for LearningStyle {
    fn from(style: Style) -> Self {
        match style {
            Style::Visual => LearningStyle::Visual,
            Style::Auditory => LearningStyle::Auditory,
            Style::Reading => LearningStyle::Reading,
            Style::Kinesthetic => LearningStyle::Kinesthetic,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one PDF or every PDF under a folder.
    #[command(group(ArgGroup::new("source").required(true).args(["file", "folder"])))]
    Ingest {
        #[arg(long)]
        file: Option<PathBuf>,
        /// Folder that contains PDFs recursively.
        #[arg(long)]
        folder: Option<PathBuf>,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Answer a question from the owner's documents.
    Ask {
        #[arg(long)]
        question: String,
        #[arg(long)]
        owner: String,
        /// Restrict the answer to a single document.
        #[arg(long)]
        document: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long, value_enum)]
        learning_style: Option<Style>,
    },
    /// Classify a question without answering it.
    Analyze {
        #[arg(long)]
        question: String,
        #[arg(long)]
        owner: String,
    },
    /// List documents, newest first.
    List {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Show one document.
    Show {
        #[arg(long)]
        id: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Delete a document and its chunks.
    Delete {
        #[arg(long)]
        id: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Document counts by status.
    Stats {
        #[arg(long)]
        owner: Option<String>,
    },
}

fn embedding_provider(cli: &Cli) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let dimensions = cli.embedding_dimensions;
    let provider: Arc<dyn EmbeddingProvider> = match cli.embedding_provider {
        EmbeddingBackend::Local => Arc::new(CharacterNgramEmbedder { dimensions }),
        EmbeddingBackend::Openai => {
            if cli.openai_api_key.trim().is_empty() {
                warn!("OPENAI_API_KEY is empty, documents will be stored without vectors");
            }
            let embedder = OpenAiEmbedder::new(
                &cli.openai_base_url,
                cli.openai_api_key.clone(),
                cli.embedding_model.clone(),
                dimensions,
            )
            .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            Arc::new(embedder)
        }
        EmbeddingBackend::Disabled => Arc::new(DisabledEmbedder { dimensions }),
    };
    Ok(provider)
}

fn language_model(cli: &Cli) -> anyhow::Result<(Arc<dyn LanguageModel>, ModelTiers)> {
    let (standard, advanced) = match cli.llm_provider {
        ModelBackend::Gemini => ("gemini-1.5-flash", "gemini-1.5-pro"),
        ModelBackend::Openai => ("gpt-4o-mini", "gpt-4o"),
        ModelBackend::Disabled => ("none", "none"),
    };
    let tiers = ModelTiers {
        standard: cli.llm_model.clone().unwrap_or_else(|| standard.to_string()),
        advanced: cli
            .llm_advanced_model
            .clone()
            .unwrap_or_else(|| advanced.to_string()),
    };

    let model: Arc<dyn LanguageModel> = match cli.llm_provider {
        ModelBackend::Gemini => {
            if cli.gemini_api_key.trim().is_empty() {
                warn!("GEMINI_API_KEY is empty, answers will use the fallback response");
            }
            Arc::new(
                GeminiModel::new(&cli.gemini_base_url, cli.gemini_api_key.clone())
                    .map_err(|error| anyhow::anyhow!(error.to_string()))?,
            )
        }
        ModelBackend::Openai => Arc::new(
            OpenAiChatModel::new(&cli.openai_base_url, cli.openai_api_key.clone())
                .map_err(|error| anyhow::anyhow!(error.to_string()))?,
        ),
        ModelBackend::Disabled => Arc::new(DisabledModel),
    };
    Ok((model, tiers))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn persist(store: &MemoryStore, path: &Path) -> anyhow::Result<()> {
    store
        .save(path)
        .await
        .map_err(|error| anyhow::anyhow!(error.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let provider = embedding_provider(&cli)?;
    let engine = Arc::new(EmbeddingEngine::new(provider, EmbeddingOptions::default()));
    let memory = Arc::new(
        MemoryStore::open(&cli.store, engine.dimensions())
            .await
            .map_err(|error| anyhow::anyhow!(error.to_string()))?,
    );
    let store: Arc<dyn DocumentStore> = memory.clone();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        store = %cli.store.display(),
        embedding_provider = engine.provider_name(),
        "pdf-tutor boot"
    );

    match &cli.command {
        Command::Ingest {
            file,
            folder,
            owner,
            subject,
            description,
        } => {
            let extractor = TextExtractor::new(ExtractionOptions::default())
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let pipeline = IngestionPipeline::new(extractor, engine.clone(), store.clone());

            if let Some(folder) = folder {
                let report = pipeline
                    .ingest_folder(folder, owner, subject.as_deref())
                    .await
                    .map_err(|error| anyhow::anyhow!(error.to_string()))?;
                for skipped in &report.skipped_files {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
                }
                persist(&memory, &cli.store).await?;
                print_json(&report)?;
            } else if let Some(file) = file {
                let outcome = pipeline
                    .ingest_path(file, owner, subject.as_deref(), description.as_deref())
                    .await
                    .map_err(|error| anyhow::anyhow!(error.to_string()))?;
                persist(&memory, &cli.store).await?;
                print_json(&outcome)?;
            }
        }
        Command::Ask {
            question,
            owner,
            document,
            session,
            learning_style,
        } => {
            let (model, tiers) = language_model(&cli)?;
            let classifier =
                KeywordClassifier::new().map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let retriever =
                ContextRetriever::new(engine.clone(), store.clone(), RetrievalOptions::default());
            let composer = AnswerComposer::new(model, tiers, ComposerOptions::default());
            let service = QuestionService::new(Arc::new(classifier), retriever, composer, store);

            let response = service
                .answer_question(QuestionRequest {
                    text: question.clone(),
                    owner_id: owner.clone(),
                    document_id: document.clone(),
                    session_id: session.clone(),
                    preferences: learning_style.map(|style| UserPreferences {
                        learning_style: style.into(),
                    }),
                })
                .await;
            print_json(&response)?;
        }
        Command::Analyze { question, owner } => {
            let subjects = store
                .list_subjects(owner)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let classifier =
                KeywordClassifier::new().map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let analysis = classifier.analyze(question, &UserContext { subjects });
            print_json(&analysis)?;
        }
        Command::List {
            owner,
            limit,
            offset,
        } => {
            let documents = store
                .list_documents(owner.as_deref(), *limit, *offset)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            print_json(&documents)?;
        }
        Command::Show { id, owner } => {
            let document = store
                .get_document(id, owner.as_deref())
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?
                .ok_or_else(|| anyhow::anyhow!("document {id} not found"))?;
            let stored_chunks = store
                .count_chunks(id)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            print_json(&json!({ "document": document, "stored_chunks": stored_chunks }))?;
        }
        Command::Delete { id, owner } => {
            let deleted = store
                .delete_document(id, owner.as_deref())
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            if deleted {
                persist(&memory, &cli.store).await?;
            }
            print_json(&json!({ "document_id": id, "deleted": deleted }))?;
        }
        Command::Stats { owner } => {
            let stats = processing_stats(store.as_ref(), owner.as_deref())
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            print_json(&stats)?;
        }
    }

    Ok(())
}
