use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::StorageError;

/// Cosine similarity in `[-1, 1]`. Zero when either side has no magnitude
/// or the lengths differ.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let mut dot = 0f32;
    let mut left_norm = 0f32;
    let mut right_norm = 0f32;
    for (a, b) in left.iter().zip(right) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Little-endian `f32` bytes, base64 encoded.
pub fn vec_to_base64(vector: &[f32]) -> String {
    let bytes: Vec<u8> = vector.iter().flat_map(|value| value.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

pub fn base64_to_vec(encoded: &str) -> Result<Vec<f32>, StorageError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|error| StorageError::CorruptSnapshot(format!("bad embedding blob: {error}")))?;

    if bytes.len() % 4 != 0 {
        return Err(StorageError::CorruptSnapshot(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|quad| f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
        .collect())
}
