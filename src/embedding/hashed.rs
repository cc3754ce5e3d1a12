//! Deterministic feature-hashing embedding provider.
//!
//! Tokenizes on whitespace, lowercases, hashes each token (FNV-1a) into one
//! of [`EMBEDDING_DIM`] buckets, and L2-normalizes the result. Two texts
//! sharing vocabulary land near each other; the output is fully reproducible
//! across runs and platforms. Useful as an offline default and in tests —
//! not a substitute for a learned model.

use anyhow::Result;

use super::{EmbeddingProvider, EMBEDDING_DIM};

pub struct HashedEmbeddingProvider;

impl HashedEmbeddingProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HashedEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingProvider for HashedEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for token in text.split_whitespace() {
            let token = token.to_lowercase();
            let bucket = (fnv1a(token.as_bytes()) as usize) % EMBEDDING_DIM;
            v[bucket] += 1.0;
        }
        l2_normalize(&mut v);
        Ok(v)
    }
}

/// FNV-1a, 64-bit. Stable across platforms, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn embedding_is_deterministic() {
        let provider = HashedEmbeddingProvider::new();
        let a = provider.embed("acme corp pays net thirty").unwrap();
        let b = provider.embed("acme corp pays net thirty").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn embedding_has_correct_dimensions_and_unit_norm() {
        let provider = HashedEmbeddingProvider::new();
        let v = provider.embed("payment terms for acme").unwrap();
        assert_eq!(v.len(), EMBEDDING_DIM);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_text_yields_zero_vector() {
        let provider = HashedEmbeddingProvider::new();
        let v = provider.embed("").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn shared_vocabulary_scores_higher_than_disjoint() {
        let provider = HashedEmbeddingProvider::new();
        let q = provider.embed("acme invoice payment terms").unwrap();
        let close = provider.embed("acme payment terms changed").unwrap();
        let far = provider.embed("quarterly staffing forecast").unwrap();
        assert!(cosine_similarity(&q, &close) > cosine_similarity(&q, &far));
    }

    #[test]
    fn case_is_folded() {
        let provider = HashedEmbeddingProvider::new();
        let a = provider.embed("Acme Corp").unwrap();
        let b = provider.embed("acme corp").unwrap();
        assert_eq!(a, b);
    }
}
