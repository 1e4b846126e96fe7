use crate::chunking::{chunk_text, ChunkingConfig};
use crate::error::IngestError;
use crate::models::{
    ExtractedChunk, Extraction, ExtractionMetadata, ExtractionMethod, ExtractionOptions,
};
use lopdf::content::Content;
use lopdf::{Document, Object, ObjectId};
use std::sync::Arc;
use tracing::{info, warn};

const PDF_SIGNATURE: &[u8] = b"%PDF-";
const SIGNATURE_SEARCH_WINDOW: usize = 1024;
const PAGE_TRUNCATION_MARKER: &str = "...[truncated for safety]";
const TEXT_LIMIT_MARKER: &str = "\n\n[Extraction stopped - content too large]";
const PAGE_LIMIT_MARKER: &str = "\n\n[Extraction stopped - page limit reached]";

const FALLBACK_TEXT: &str = "This PDF could not be properly parsed due to formatting issues. \
The system attempted a layout-aware extraction and a sequential text reader, and neither \
recovered readable text. The file may have corrupted font information, scanned images \
instead of text, or complex formatting that prevents automatic extraction. \
Try re-saving the PDF from the original source or uploading a different copy. \
Questions can still be asked, but answers will not be able to reference specific \
content from this document.";

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct PageExtraction {
    pub total_pages: u32,
    pub pages: Vec<PageText>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractionLimits {
    pub max_pages: u32,
    pub max_raw_chars_per_page: usize,
}

pub trait PdfExtractor: Send + Sync {
    fn method(&self) -> ExtractionMethod;
    fn extract_pages(
        &self,
        bytes: &[u8],
        limits: &ExtractionLimits,
    ) -> Result<PageExtraction, IngestError>;
}

/// Page-by-page extraction over `lopdf`, trying progressively cruder
/// strategies for each page.
#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Layout
    }

    fn extract_pages(
        &self,
        bytes: &[u8],
        limits: &ExtractionLimits,
    ) -> Result<PageExtraction, IngestError> {
        let document =
            Document::load_mem(bytes).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let page_ids = document.get_pages();
        let total_pages = page_ids.len() as u32;
        if total_pages == 0 {
            return Err(IngestError::PdfParse("pdf has no pages".to_string()));
        }
        if total_pages > limits.max_pages {
            warn!(
                total_pages,
                max_pages = limits.max_pages,
                "page limit exceeded, extracting leading pages only"
            );
        }

        let pages = page_ids
            .iter()
            .take(limits.max_pages as usize)
            .map(|(&number, &page_id)| PageText {
                number,
                text: page_text(&document, number, page_id, limits),
            })
            .collect();

        Ok(PageExtraction { total_pages, pages })
    }
}

fn page_text(
    document: &Document,
    number: u32,
    page_id: ObjectId,
    limits: &ExtractionLimits,
) -> String {
    if let Ok(text) = document.extract_text(&[number]) {
        if !text.trim().is_empty() {
            return text;
        }
    }

    let Ok(content) = document.get_page_content(page_id) else {
        return String::new();
    };

    if let Ok(decoded) = Content::decode(&content) {
        let text = text_from_operations(&decoded);
        if !text.trim().is_empty() {
            return text;
        }
    }

    raw_string_literals(&content, limits.max_raw_chars_per_page)
}

/// Rebuilds text from the page's text-showing operators, treating line
/// moves as line breaks and large negative kerning as word gaps.
fn text_from_operations(content: &Content) -> String {
    let mut text = String::new();

    for operation in &content.operations {
        match operation.operator.as_str() {
            "Tj" | "'" | "\"" => {
                if matches!(operation.operator.as_str(), "'" | "\"") {
                    text.push('\n');
                }
                for operand in &operation.operands {
                    if let Object::String(bytes, _) = operand {
                        push_lossy(&mut text, bytes);
                    }
                }
            }
            "TJ" => {
                for operand in &operation.operands {
                    let Object::Array(items) = operand else {
                        continue;
                    };
                    for item in items {
                        match item {
                            Object::String(bytes, _) => {
                                push_lossy(&mut text, bytes);
                            }
                            Object::Integer(offset) if *offset < -200 => text.push(' '),
                            Object::Real(offset) if *offset < -200.0 => text.push(' '),
                            _ => {}
                        }
                    }
                }
            }
            "Td" | "TD" | "T*" | "ET" => {
                if !text.ends_with('\n') && !text.is_empty() {
                    text.push('\n');
                }
            }
            _ => {}
        }
    }

    text
}

/// Last resort: concatenates every `( ... )` literal in the raw content
/// stream, capped at `max_chars`.
fn raw_string_literals(content: &[u8], max_chars: usize) -> String {
    let mut text = String::new();
    let mut current = Vec::new();
    let mut chars = 0usize;
    let mut depth = 0usize;
    let mut escaped = false;

    for &byte in content {
        if chars >= max_chars {
            break;
        }

        if depth == 0 {
            if byte == b'(' {
                depth = 1;
                current.clear();
            }
            continue;
        }

        if escaped {
            escaped = false;
            current.push(match byte {
                b'n' => b'\n',
                b'r' => b'\r',
                b't' => b'\t',
                other => other,
            });
            continue;
        }

        match byte {
            b'\\' => escaped = true,
            b'(' => {
                depth += 1;
                current.push(byte);
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    chars += push_lossy(&mut text, &current) + 1;
                    text.push(' ');
                } else {
                    current.push(byte);
                }
            }
            _ => current.push(byte),
        }
    }

    text.chars().take(max_chars).collect()
}

/// Returns the number of chars appended.
fn push_lossy(target: &mut String, bytes: &[u8]) -> usize {
    let mut pushed = 0;
    for &byte in bytes {
        if byte == b' ' || byte == b'\n' || byte.is_ascii_graphic() || byte >= 0xA0 {
            target.push(char::from(byte));
            pushed += 1;
        }
    }
    pushed
}

/// Whole-document reader over `pdf-extract`; pages are split on form feeds.
#[derive(Default)]
pub struct SequentialExtractor;

impl PdfExtractor for SequentialExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Sequential
    }

    fn extract_pages(
        &self,
        bytes: &[u8],
        limits: &ExtractionLimits,
    ) -> Result<PageExtraction, IngestError> {
        let text = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut segments: Vec<&str> = text.split('\u{000c}').collect();
        while segments.len() > 1 && segments.last().is_some_and(|last| last.trim().is_empty()) {
            segments.pop();
        }

        let total_pages = (segments.len() as u32).max(recover_page_count(bytes));
        let pages = segments
            .into_iter()
            .take(limits.max_pages as usize)
            .enumerate()
            .map(|(index, segment)| PageText {
                number: index as u32 + 1,
                text: segment.to_string(),
            })
            .collect();

        Ok(PageExtraction { total_pages, pages })
    }
}

/// Best-effort page count for documents no extractor could read.
pub fn recover_page_count(bytes: &[u8]) -> u32 {
    if let Ok(document) = Document::load_mem(bytes) {
        return document.get_pages().len() as u32;
    }

    regex::bytes::Regex::new(r"/Type\s*/Page\b")
        .map(|pattern| pattern.find_iter(bytes).count() as u32)
        .unwrap_or(0)
}

pub struct TextExtractor {
    methods: Vec<Arc<dyn PdfExtractor>>,
    options: ExtractionOptions,
}

impl TextExtractor {
    pub fn new(options: ExtractionOptions) -> Result<Self, IngestError> {
        Self::with_methods(
            vec![Arc::new(LopdfExtractor), Arc::new(SequentialExtractor)],
            options,
        )
    }

    /// Methods are attempted in order; the first that yields text wins.
    pub fn with_methods(
        methods: Vec<Arc<dyn PdfExtractor>>,
        mut options: ExtractionOptions,
    ) -> Result<Self, IngestError> {
        options.chunking = options.chunking.validated()?;
        Ok(Self { methods, options })
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    pub fn validate(&self, bytes: &[u8]) -> Result<(), IngestError> {
        if bytes.is_empty() {
            return Err(IngestError::Validation("empty file content".to_string()));
        }

        if bytes.len() > self.options.max_file_bytes {
            return Err(IngestError::Validation(format!(
                "pdf file too large: {} MiB (max {} MiB)",
                bytes.len() / 1024 / 1024,
                self.options.max_file_bytes / 1024 / 1024
            )));
        }

        let window = &bytes[..bytes.len().min(SIGNATURE_SEARCH_WINDOW)];
        if !window
            .windows(PDF_SIGNATURE.len())
            .any(|candidate| candidate == PDF_SIGNATURE)
        {
            return Err(IngestError::Validation(
                "content does not carry a PDF signature".to_string(),
            ));
        }

        Ok(())
    }

    /// Only validation failures are returned as errors. Once the input is
    /// accepted, a usable chunk set always comes back, degraded to a
    /// fallback explanation when every method fails.
    pub async fn extract(&self, bytes: &[u8], filename: &str) -> Result<Extraction, IngestError> {
        self.validate(bytes)?;
        Ok(self.extract_validated(bytes, filename).await)
    }

    /// Extraction for input that already passed [`TextExtractor::validate`].
    pub async fn extract_validated(&self, bytes: &[u8], filename: &str) -> Extraction {
        info!(filename, size_kb = bytes.len() / 1024, "starting text extraction");

        let shared: Arc<[u8]> = Arc::from(bytes);
        let mut errors = Vec::new();

        for method in &self.methods {
            let label = method.method().as_str();
            let attempt = self
                .run_method(Arc::clone(method), Arc::clone(&shared))
                .await
                .and_then(|pages| self.assemble(method.method(), pages));

            match attempt {
                Ok(extraction) => {
                    info!(
                        filename,
                        method = label,
                        chunk_count = extraction.chunks.len(),
                        "text extraction succeeded"
                    );
                    return Extraction {
                        metadata: ExtractionMetadata {
                            errors,
                            ..extraction.metadata
                        },
                        ..extraction
                    };
                }
                Err(error) => {
                    warn!(filename, method = label, %error, "extraction method failed");
                    errors.push(format!("{label}: {error}"));
                }
            }
        }

        warn!(filename, "all extraction methods failed, using fallback content");
        self.fallback(&shared, filename, errors)
    }

    async fn run_method(
        &self,
        method: Arc<dyn PdfExtractor>,
        bytes: Arc<[u8]>,
    ) -> Result<PageExtraction, IngestError> {
        let limits = ExtractionLimits {
            max_pages: self.options.max_pages,
            max_raw_chars_per_page: self.options.max_raw_chars_per_page,
        };

        let task = tokio::task::spawn_blocking(move || method.extract_pages(&bytes, &limits));

        match tokio::time::timeout(self.options.method_timeout, task).await {
            Err(_) => Err(IngestError::Timeout(self.options.method_timeout)),
            Ok(Err(join_error)) => Err(IngestError::TaskAborted(join_error.to_string())),
            Ok(Ok(result)) => result,
        }
    }

    fn assemble(
        &self,
        method: ExtractionMethod,
        extraction: PageExtraction,
    ) -> Result<Extraction, IngestError> {
        let processed_pages = extraction.pages.len() as u32;
        let mut assembled = assemble_text(&extraction.pages, &self.options);

        if assembled.text.trim().is_empty() {
            return Err(IngestError::PdfParse(format!(
                "no text content found (tried {processed_pages} pages)"
            )));
        }

        let mut note = None;
        let pages_omitted = processed_pages >= self.options.max_pages
            && extraction.total_pages > processed_pages;
        if pages_omitted && !assembled.truncated {
            assembled.text.push_str(PAGE_LIMIT_MARKER);
            assembled.truncated = true;
            note = Some(format!(
                "only the first {processed_pages} of {} pages were extracted",
                extraction.total_pages
            ));
            warn!(
                total_pages = extraction.total_pages,
                max_pages = self.options.max_pages,
                "text extraction stopped at page limit"
            );
        }

        let total_pages = extraction.total_pages.max(1);
        let chunked = chunk_text(&assembled.text, total_pages, self.options.chunking);

        Ok(Extraction {
            chunks: chunked.chunks,
            metadata: ExtractionMetadata {
                method,
                total_pages,
                processed_pages,
                successful_pages: assembled.successful_pages,
                total_characters: assembled.text.chars().count(),
                text_truncated: assembled.truncated,
                chunk_limit_reached: chunked.limit_reached,
                errors: Vec::new(),
                note,
            },
        })
    }

    fn fallback(&self, bytes: &[u8], filename: &str, errors: Vec<String>) -> Extraction {
        let page_count = recover_page_count(bytes);
        let mut text = format!("{FALLBACK_TEXT} (file: {filename})");
        if page_count > 0 {
            text.push_str(&format!(" The PDF appears to have {page_count} pages."));
        }

        let config = ChunkingConfig {
            max_chunks: 1,
            ..self.options.chunking
        };
        let mut chunks = chunk_text(&text, 1, config).chunks;
        if chunks.is_empty() {
            chunks.push(ExtractedChunk {
                chunk_size: text.chars().count(),
                end_char: text.chars().count(),
                content: text.clone(),
                chunk_index: 0,
                page_number: 1,
                start_char: 0,
            });
        }

        Extraction {
            chunks,
            metadata: ExtractionMetadata {
                method: ExtractionMethod::Fallback,
                total_pages: page_count.max(1),
                processed_pages: 0,
                successful_pages: 0,
                total_characters: text.chars().count(),
                text_truncated: false,
                chunk_limit_reached: false,
                errors,
                note: Some("fallback content due to extraction failure".to_string()),
            },
        }
    }
}

struct AssembledText {
    text: String,
    successful_pages: u32,
    truncated: bool,
}

fn assemble_text(pages: &[PageText], options: &ExtractionOptions) -> AssembledText {
    let mut text = String::new();
    let mut successful_pages = 0;
    let mut truncated = false;

    for page in pages {
        let trimmed = page.text.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut piece = String::new();
        if trimmed.chars().count() > options.max_chars_per_page {
            piece.extend(trimmed.chars().take(options.max_chars_per_page));
            piece.push_str(PAGE_TRUNCATION_MARKER);
        } else {
            piece.push_str(trimmed);
        }

        let separator = if text.is_empty() { 0 } else { 2 };
        if text.len() + separator + piece.len() > options.max_total_chars {
            // Whole pages only, unless the very first page is already too large.
            if text.is_empty() {
                let mut cut = options.max_total_chars;
                while !piece.is_char_boundary(cut) {
                    cut -= 1;
                }
                piece.truncate(cut);
                text = piece;
                successful_pages += 1;
            }
            text.push_str(TEXT_LIMIT_MARKER);
            truncated = true;
            warn!(
                max_total_chars = options.max_total_chars,
                page = page.number,
                "text extraction stopped at size limit"
            );
            break;
        }

        if separator > 0 {
            text.push_str("\n\n");
        }
        text.push_str(&piece);
        successful_pages += 1;
    }

    AssembledText {
        text,
        successful_pages,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pdf_with_pages, prose_pages};
    use std::time::Duration;

    struct FailingExtractor;

    impl PdfExtractor for FailingExtractor {
        fn method(&self) -> ExtractionMethod {
            ExtractionMethod::Layout
        }

        fn extract_pages(
            &self,
            _bytes: &[u8],
            _limits: &ExtractionLimits,
        ) -> Result<PageExtraction, IngestError> {
            Err(IngestError::PdfParse("broken xref".to_string()))
        }
    }

    struct SlowExtractor;

    impl PdfExtractor for SlowExtractor {
        fn method(&self) -> ExtractionMethod {
            ExtractionMethod::Layout
        }

        fn extract_pages(
            &self,
            _bytes: &[u8],
            _limits: &ExtractionLimits,
        ) -> Result<PageExtraction, IngestError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(PageExtraction {
                total_pages: 1,
                pages: vec![PageText {
                    number: 1,
                    text: "late".to_string(),
                }],
            })
        }
    }

    struct FixedExtractor(Vec<&'static str>);

    impl PdfExtractor for FixedExtractor {
        fn method(&self) -> ExtractionMethod {
            ExtractionMethod::Sequential
        }

        fn extract_pages(
            &self,
            _bytes: &[u8],
            _limits: &ExtractionLimits,
        ) -> Result<PageExtraction, IngestError> {
            Ok(PageExtraction {
                total_pages: self.0.len() as u32,
                pages: self
                    .0
                    .iter()
                    .enumerate()
                    .map(|(index, text)| PageText {
                        number: index as u32 + 1,
                        text: text.to_string(),
                    })
                    .collect(),
            })
        }
    }

    fn extractor_with(methods: Vec<Arc<dyn PdfExtractor>>) -> TextExtractor {
        let options = ExtractionOptions {
            method_timeout: Duration::from_millis(50),
            ..ExtractionOptions::default()
        };
        TextExtractor::with_methods(methods, options).expect("default options are valid")
    }

    #[tokio::test]
    async fn rejects_empty_oversized_and_non_pdf_input() {
        let options = ExtractionOptions {
            max_file_bytes: 16,
            ..ExtractionOptions::default()
        };
        let extractor = TextExtractor::new(options).expect("options are valid");

        for input in [&b""[..], b"plain text, no pdf", b"%PDF-1.4 but far too long"] {
            let result = extractor.extract(input, "x.pdf").await;
            assert!(matches!(result, Err(IngestError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn extracts_text_from_real_multi_page_pdf() -> Result<(), IngestError> {
        let bytes = pdf_with_pages(&prose_pages(3, 1_700));
        let extractor = TextExtractor::new(ExtractionOptions::default())?;

        let extraction = extractor.extract(&bytes, "notes.pdf").await?;

        assert_eq!(extraction.metadata.method, ExtractionMethod::Layout);
        assert_eq!(extraction.metadata.total_pages, 3);
        assert_eq!(extraction.metadata.successful_pages, 3);
        assert!(extraction.chunks.len() >= 2);
        for (position, chunk) in extraction.chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index as usize, position);
            assert!((1..=3).contains(&chunk.page_number));
            assert!(chunk.start_char < chunk.end_char);
        }
        assert!(extraction.chunks[0].content.contains("hydraulic"));
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_pdf_degrades_to_single_fallback_chunk() -> Result<(), IngestError> {
        let extractor = TextExtractor::new(ExtractionOptions::default())?;

        let extraction = extractor
            .extract(b"%PDF-1.4\n%broken beyond repair", "broken.pdf")
            .await?;

        assert_eq!(extraction.metadata.method, ExtractionMethod::Fallback);
        assert_eq!(extraction.chunks.len(), 1);
        assert_eq!(extraction.chunks[0].page_number, 1);
        assert!(extraction.chunks[0].content.contains("broken.pdf"));
        assert_eq!(extraction.metadata.errors.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn timed_out_method_falls_through_to_next() -> Result<(), IngestError> {
        let extractor = extractor_with(vec![
            Arc::new(SlowExtractor),
            Arc::new(FixedExtractor(vec!["Second method text."])),
        ]);

        let extraction = extractor.extract(b"%PDF-1.7 stub", "slow.pdf").await?;

        assert_eq!(extraction.metadata.method, ExtractionMethod::Sequential);
        assert_eq!(extraction.chunks[0].content, "Second method text.");
        assert_eq!(extraction.metadata.errors.len(), 1);
        assert!(extraction.metadata.errors[0].contains("timed out"));
        Ok(())
    }

    #[tokio::test]
    async fn blank_pages_count_as_failure() -> Result<(), IngestError> {
        let extractor = extractor_with(vec![
            Arc::new(FixedExtractor(vec!["  ", "\n"])),
            Arc::new(FailingExtractor),
        ]);

        let extraction = extractor.extract(b"%PDF-1.7 stub", "blank.pdf").await?;

        assert_eq!(extraction.metadata.method, ExtractionMethod::Fallback);
        assert_eq!(extraction.chunks.len(), 1);
        assert!(extraction.metadata.errors[0].contains("no text content"));
        assert!(extraction.metadata.errors[1].contains("broken xref"));
        Ok(())
    }

    #[test]
    fn accumulated_text_is_capped_with_marker() {
        let options = ExtractionOptions {
            max_chars_per_page: 30,
            max_total_chars: 80,
            ..ExtractionOptions::default()
        };
        let pages = (1..=5)
            .map(|number| PageText {
                number,
                text: "word ".repeat(20),
            })
            .collect::<Vec<_>>();

        let assembled = assemble_text(&pages, &options);

        assert!(assembled.truncated);
        assert_eq!(assembled.successful_pages, 1);
        assert_eq!(
            assembled.text,
            format!(
                "{}{PAGE_TRUNCATION_MARKER}{TEXT_LIMIT_MARKER}",
                "word ".repeat(6)
            )
        );
    }

    #[test]
    fn oversized_first_page_is_cut_at_total_limit() {
        let options = ExtractionOptions {
            max_chars_per_page: 1_000,
            max_total_chars: 12,
            ..ExtractionOptions::default()
        };
        let pages = vec![
            PageText {
                number: 1,
                text: "héllo wörld and more".to_string(),
            },
            PageText {
                number: 2,
                text: "never reached".to_string(),
            },
        ];

        let assembled = assemble_text(&pages, &options);

        assert!(assembled.truncated);
        assert_eq!(assembled.successful_pages, 1);
        assert!(assembled.text.starts_with("héllo wö"));
        assert!(assembled.text.ends_with(TEXT_LIMIT_MARKER));
        assert!(!assembled.text.contains("never"));
    }

    #[test]
    fn dropped_pages_leave_page_limit_marker() -> Result<(), IngestError> {
        let options = ExtractionOptions {
            max_pages: 2,
            ..ExtractionOptions::default()
        };
        let extractor = TextExtractor::with_methods(Vec::new(), options)?;
        let extraction = PageExtraction {
            total_pages: 5,
            pages: vec![
                PageText {
                    number: 1,
                    text: "Pressure is force per unit area.".to_string(),
                },
                PageText {
                    number: 2,
                    text: "Pascal's law governs fluids.".to_string(),
                },
            ],
        };

        let assembled = extractor.assemble(ExtractionMethod::Layout, extraction)?;

        assert!(assembled.metadata.text_truncated);
        assert_eq!(assembled.metadata.processed_pages, 2);
        assert_eq!(
            assembled.metadata.note.as_deref(),
            Some("only the first 2 of 5 pages were extracted")
        );
        let last = assembled.chunks.last().map(|chunk| chunk.content.as_str());
        assert!(last.is_some_and(|content| content.contains("page limit reached")));
        Ok(())
    }

    #[test]
    fn raw_literals_handle_escapes_and_cap() {
        let stream = br"BT (Hello\) world) Tj (again) Tj ET";
        assert_eq!(raw_string_literals(stream, 100), "Hello) world again ");
        assert_eq!(raw_string_literals(stream, 5), "Hello");
    }

    #[test]
    fn raw_literals_stop_early_on_large_streams() {
        let stream = b"(abcdefghij) Tj ".repeat(200_000);
        let text = raw_string_literals(&stream, 25);
        assert_eq!(text, "abcdefghij abcdefghij abc");
    }

    #[test]
    fn page_count_is_recovered_from_raw_objects() {
        let bytes = b"%PDF-1.4 1 0 obj << /Type /Page >> 2 0 obj << /Type/Page >> \
                      3 0 obj << /Type /Pages >>";
        assert_eq!(recover_page_count(bytes), 2);
    }
}
