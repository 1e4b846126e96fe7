use crate::error::IngestError;
use crate::models::ExtractedChunk;
use sha2::{Digest, Sha256};
use tracing::warn;

const MIN_CHUNK_SIZE: usize = 100;
const SENTENCE_TERMINATORS: [char; 3] = ['.', '!', '?'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
    pub max_chunks: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2_000,
            overlap: 150,
            max_chunks: 100,
        }
    }
}

impl ChunkingConfig {
    /// Clamps the window to at least 100 chars and the overlap to half the window.
    pub fn validated(self) -> Result<Self, IngestError> {
        if self.max_chunks == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chunks must be at least 1".to_string(),
            ));
        }

        let chunk_size = self.chunk_size.max(MIN_CHUNK_SIZE);
        Ok(Self {
            chunk_size,
            overlap: self.overlap.min(chunk_size / 2),
            max_chunks: self.max_chunks,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChunkedText {
    pub chunks: Vec<ExtractedChunk>,
    pub limit_reached: bool,
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Splits `text` into overlapping windows.
///
/// A window that would end mid-text is pulled back to the last sentence
/// terminator past the overlap region, else the last whitespace, else it is
/// hard-cut. Page numbers are interpolated from the window's start offset
/// over `total_pages`, so they are approximate.
pub fn chunk_text(text: &str, total_pages: u32, config: ChunkingConfig) -> ChunkedText {
    let chars: Vec<char> = text.trim().chars().collect();
    let len = chars.len();
    let total_pages = total_pages.max(1);

    if len == 0 {
        return ChunkedText {
            chunks: Vec::new(),
            limit_reached: false,
        };
    }

    if len <= config.chunk_size {
        let content: String = chars.iter().collect();
        return ChunkedText {
            chunks: vec![ExtractedChunk {
                chunk_size: len,
                content,
                chunk_index: 0,
                page_number: 1,
                start_char: 0,
                end_char: len,
            }],
            limit_reached: false,
        };
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < len && chunks.len() < config.max_chunks {
        let mut end = (start + config.chunk_size).min(len);

        if end < len {
            end = find_break(&chars, start, end, config.overlap);
        }

        let content: String = chars[start..end]
            .iter()
            .collect::<String>()
            .trim()
            .to_string();
        if !content.is_empty() {
            chunks.push(ExtractedChunk {
                chunk_size: content.chars().count(),
                content,
                chunk_index: chunks.len() as u32,
                page_number: estimate_page(start, len, total_pages),
                start_char: start,
                end_char: end,
            });
        }

        if end >= len {
            start = len;
            break;
        }

        let next = end.saturating_sub(config.overlap);
        start = if next > start { next } else { end };
    }

    let limit_reached = start < len;
    if limit_reached {
        warn!(
            max_chunks = config.max_chunks,
            covered_chars = start,
            total_chars = len,
            "chunk limit reached, remaining text is not indexed"
        );
    }

    ChunkedText {
        chunks,
        limit_reached,
    }
}

fn find_break(chars: &[char], start: usize, end: usize, overlap: usize) -> usize {
    let floor = start + overlap;

    if let Some(position) = (floor + 1..end)
        .rev()
        .find(|&index| SENTENCE_TERMINATORS.contains(&chars[index - 1]))
    {
        return position;
    }

    (floor + 1..end)
        .rev()
        .find(|&index| chars[index].is_whitespace())
        .unwrap_or(end)
}

pub fn estimate_page(start_char: usize, total_chars: usize, total_pages: u32) -> u32 {
    if total_chars == 0 {
        return 1;
    }
    let ratio = start_char as f64 / total_chars as f64;
    let page = (ratio * f64::from(total_pages)).floor() as u32 + 1;
    page.clamp(1, total_pages.max(1))
}

pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn make_chunk_id(document_id: &str, index: u32, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
