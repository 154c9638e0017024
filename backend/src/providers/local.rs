use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::Embedder;
use crate::errors::ProviderFailure;
use crate::retrieval::search::tokenize;

/// Feature-hashing embedder used when no embedding service is configured.
///
/// Each lowercase word (and each adjacent word pair) is hashed into one of
/// `dims` buckets with a hash-derived sign; the vector is L2-normalized.
/// Deterministic across processes, so persisted indexes stay comparable.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub const MODEL_NAME: &'static str = "local-hashing-384";

    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let tokens = tokenize(text);
        let mut vector = vec![0.0f32; self.dims];

        let pairs = tokens.windows(2).map(|w| format!("{} {}", w[0], w[1]));
        for feature in tokens.iter().cloned().chain(pairs) {
            let digest = Sha256::digest(feature.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        Self::MODEL_NAME
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderFailure> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::search::cosine_similarity;

    #[test]
    fn test_deterministic_and_normalized() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed_one("list comprehension in python");
        let b = embedder.embed_one("list comprehension in python");
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_similar_texts_score_higher() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed_one("python list comprehension");
        let close = embedder.embed_one("a list comprehension builds a python list");
        let far = embedder.embed_one("css grid layout alignment");
        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        assert!(embedder.embed_one("  ").iter().all(|v| *v == 0.0));
    }
}
