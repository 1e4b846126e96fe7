use crate::embeddings::{EmbeddingEngine, EmbeddingProvider};
use crate::error::EmbeddingError;
use crate::extractor::TextExtractor;
use crate::ingest::IngestionPipeline;
use crate::models::{
    Chunk, EmbeddingOptions, ExtractionMethod, ExtractionOptions, NewDocument, StatusUpdate,
};
use crate::traits::DocumentStore;
use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::sync::Arc;
use std::time::Duration;

const LINE_CHARS: usize = 80;

/// Sentences about a handful of engineering topics, cut into pages of
/// roughly `chars_per_page` characters.
pub(crate) fn prose_pages(pages: usize, chars_per_page: usize) -> Vec<String> {
    const SENTENCES: [&str; 4] = [
        "The hydraulic pump raises pressure in the main circuit.",
        "Flow rate is defined as volume moved per unit of time.",
        "Solve for pressure with the formula force divided by area.",
        "Each valve step in the procedure must be checked twice.",
    ];

    (0..pages)
        .map(|page| {
            let mut text = String::new();
            let mut index = page;
            while text.len() < chars_per_page {
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(SENTENCES[index % SENTENCES.len()]);
                index += 1;
            }
            text
        })
        .collect()
}

/// Builds an uncompressed PDF with one Courier text block per page.
pub(crate) fn pdf_with_pages(pages: &[String]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids = Vec::new();
    for page in pages {
        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 9.into()]),
            Operation::new("TL", vec![11.into()]),
            Operation::new("Td", vec![40.into(), 800.into()]),
        ];
        for line in wrap(page) {
            operations.push(Operation::new("Tj", vec![Object::string_literal(line)]));
            operations.push(Operation::new("T*", vec![]));
        }
        operations.push(Operation::new("ET", vec![]));

        let content = Content { operations };
        let encoded = content.encode().unwrap_or_default();
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(Object::from(page_id));
    }

    let page_count = kids.len() as i64;
    let pages_dict = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => page_count,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("in-memory pdf write succeeds");
    bytes
}

fn wrap(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + word.len() + 1 > LINE_CHARS {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Returns the same unit vector for every input, so stored vectors built
/// with [`at_similarity`] score exactly their first component.
pub(crate) struct FixedEmbedder;

#[async_trait]
impl EmbeddingProvider for FixedEmbedder {
    fn name(&self) -> &str {
        "fixed"
    }

    fn dimensions(&self) -> usize {
        2
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, EmbeddingError> {
        Ok(vec![Some(vec![1.0, 0.0]); texts.len()])
    }
}

/// A unit vector whose cosine against `[1, 0]` is `similarity`.
pub(crate) fn at_similarity(similarity: f32) -> Vec<f32> {
    vec![similarity, (1.0 - similarity * similarity).max(0.0).sqrt()]
}

pub(crate) fn engine(provider: Arc<dyn EmbeddingProvider>) -> Arc<EmbeddingEngine> {
    Arc::new(EmbeddingEngine::new(
        provider,
        EmbeddingOptions {
            inter_group_delay: Duration::ZERO,
            ..EmbeddingOptions::default()
        },
    ))
}

pub(crate) fn pipeline(
    store: Arc<dyn DocumentStore>,
    provider: Arc<dyn EmbeddingProvider>,
) -> IngestionPipeline {
    let extractor =
        TextExtractor::new(ExtractionOptions::default()).expect("default options are valid");
    IngestionPipeline::new(extractor, engine(provider), store)
}

/// Creates a completed document whose chunks carry the given texts and
/// similarities.
pub(crate) async fn seed_document(
    store: &dyn DocumentStore,
    owner: &str,
    subject: &str,
    name: &str,
    chunks: &[(&str, f32)],
) -> String {
    let id = store
        .create_document(NewDocument {
            owner_id: owner.to_string(),
            subject: subject.to_string(),
            description: None,
            original_filename: name.to_string(),
            stored_filename: name.to_string(),
            file_size: 1,
            checksum: String::new(),
        })
        .await
        .expect("document created");

    let rows: Vec<Chunk> = chunks
        .iter()
        .enumerate()
        .map(|(index, (content, similarity))| Chunk {
            chunk_id: format!("{id}-{index}"),
            document_id: id.clone(),
            chunk_index: index as u32,
            page_number: index as u32 + 1,
            content: content.to_string(),
            chunk_size: content.chars().count(),
            token_count: content.split_whitespace().count(),
            start_char: 0,
            end_char: content.chars().count(),
            extraction_method: ExtractionMethod::Layout,
            embedding: Some(at_similarity(*similarity)),
        })
        .collect();
    store.batch_insert_chunks(&rows).await.expect("chunks inserted");
    store
        .update_document_status(&id, StatusUpdate::completed(rows.len(), rows.len() as u32))
        .await
        .expect("status updated");
    id
}
