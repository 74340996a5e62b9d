//! Embedding backend capability.
//!
//! The core treats the embedding model as opaque: anything that can turn a
//! batch of texts into an `f32` matrix plugs in through
//! [`EmbeddingBackend`].  The bundled [`HashingEmbedder`] is a fully
//! offline, deterministic token-hashing projection — good enough to build,
//! test, and query packs without a model, and the reason two builds of the
//! same corpus are byte-identical.

use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;

/// A pluggable text encoder.
pub trait EmbeddingBackend: Send + Sync {
    /// Encode a batch of texts into one vector each.  Row order must match
    /// input order; rows need not be normalized (the pipeline normalizes).
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dim(&self) -> u32;
    fn name(&self) -> &str;
}

/// Dense row-major `f32` matrix, the embedder's batch output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matrix {
    pub dim: usize,
    pub data: Vec<f32>,
}

impl Matrix {
    pub fn with_dim(dim: usize) -> Matrix {
        Matrix { dim, data: Vec::new() }
    }

    pub fn rows(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn push_row(&mut self, row: &[f32]) {
        debug_assert_eq!(row.len(), self.dim);
        self.data.extend_from_slice(row);
    }
}

/// Scale `v` to unit L2 norm.  The zero vector becomes `e0` so cosine math
/// never divides by zero.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    } else if let Some(first) = v.first_mut() {
        *first = 1.0;
    }
}

/// Offline deterministic backend: signed token hashing.
///
/// Each lowercase alphanumeric token (and each adjacent token bigram, which
/// preserves some phrase locality) is hashed with XXH3; the hash picks a
/// bucket and a sign.  No model weights, no I/O, no randomness.
pub struct HashingEmbedder {
    dim: u32,
}

impl HashingEmbedder {
    pub const DEFAULT_DIM: u32 = 256;

    pub fn new(dim: u32) -> HashingEmbedder {
        HashingEmbedder { dim: dim.max(1) }
    }

    fn accumulate(&self, vector: &mut [f32], token: &str, weight: f32) {
        let h = xxh3_64(token.as_bytes());
        let bucket = (h % self.dim as u64) as usize;
        let sign = if h & (1 << 63) == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIM)
    }
}

impl EmbeddingBackend for HashingEmbedder {
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let mut v = vec![0.0f32; self.dim as usize];
            let tokens: Vec<String> = text
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(|t| t.to_lowercase())
                .collect();
            for token in &tokens {
                self.accumulate(&mut v, token, 1.0);
            }
            for pair in tokens.windows(2) {
                self.accumulate(&mut v, &format!("{} {}", pair[0], pair[1]), 0.5);
            }
            out.push(v);
        }
        Ok(out)
    }

    fn dim(&self) -> u32 {
        self.dim
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_deterministic() {
        let backend = HashingEmbedder::default();
        let texts = vec!["Quantum superposition of states".to_string()];
        assert_eq!(
            backend.encode(&texts).unwrap(),
            backend.encode(&texts).unwrap()
        );
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let backend = HashingEmbedder::default();
        let texts = vec![
            "quantum superposition and entanglement".to_string(),
            "the quantum superposition principle".to_string(),
            "recipe for sourdough bread baking".to_string(),
        ];
        let mut rows = backend.encode(&texts).unwrap();
        for row in &mut rows {
            normalize(row);
        }
        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&rows[0], &rows[1]) > dot(&rows[0], &rows[2]));
    }

    #[test]
    fn normalize_handles_the_zero_vector() {
        let mut v = vec![0.0f32; 4];
        normalize(&mut v);
        assert_eq!(v, vec![1.0, 0.0, 0.0, 0.0]);

        let mut w = vec![3.0f32, 4.0];
        normalize(&mut w);
        assert!((w.iter().map(|x| x * x).sum::<f32>() - 1.0).abs() < 1e-6);
    }
}
