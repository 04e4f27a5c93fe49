use crate::credentials::{ApiKey, CredentialStrategy};
use crate::error::ProviderError;
use crate::models::Chunk;
use crate::traits::EmbeddingProvider;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

/// Attaches embeddings to chunks, all or nothing.
///
/// Any provider failure yields an empty list: callers read empty as "retry
/// later", never as "nothing relevant".
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    keys: Arc<dyn CredentialStrategy>,
}

impl EmbeddingGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, keys: Arc<dyn CredentialStrategy>) -> Self {
        Self { provider, keys }
    }

    pub async fn embed(&self, mut chunks: Vec<Chunk>) -> Vec<Chunk> {
        if chunks.is_empty() {
            return chunks;
        }

        let texts: Vec<&str> = chunks.iter().map(|chunk| chunk.text.as_str()).collect();
        let key = self.keys.current();
        let result = self.provider.embed_batch(&key, &texts).await;

        let embeddings = match result {
            Ok(embeddings) if embeddings.len() == chunks.len() => embeddings,
            Ok(embeddings) => {
                error!(
                    expected = chunks.len(),
                    received = embeddings.len(),
                    "embedding count mismatch; discarding batch"
                );
                return Vec::new();
            }
            Err(error) => {
                self.absorb(&key, &error);
                return Vec::new();
            }
        };

        for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
            chunk.embedding = Some(embedding);
        }
        info!(chunks = chunks.len(), "generated embeddings");
        chunks
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let key = self.keys.current();
        let result = self.provider.embed_query(&key, text).await;
        if matches!(&result, Err(error) if error.is_quota()) {
            self.keys.next();
        }
        result
    }

    fn absorb(&self, key: &ApiKey, error: &ProviderError) {
        match error {
            ProviderError::QuotaExceeded(_) => {
                error!(key = ?key, %error, "quota exceeded while generating embeddings");
                self.keys.next();
            }
            ProviderError::TransientNetwork(_) => {
                error!(%error, "network error while generating embeddings");
            }
            _ => {
                error!(%error, "embedding provider error");
            }
        }
    }
}

/// Deterministic character-trigram hashing embedder for offline use and tests.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    pub dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashingEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for c in window {
                let mut buffer = [0u8; 4];
                for byte in c.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed_batch(
        &self,
        _key: &ApiKey,
        texts: &[&str],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}
