use crate::credentials::ApiKey;
use crate::error::{ProviderError, StoreError};
use crate::models::{Chunk, EncodedImage, RetrievedResult};
use async_trait::async_trait;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per input text, in input order.
    async fn embed_batch(&self, key: &ApiKey, texts: &[&str])
        -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Vector for a search query. Providers that embed queries and documents
    /// differently override this.
    async fn embed_query(&self, key: &ApiKey, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed_batch(key, &[text]).await?;
        if vectors.len() != 1 {
            return Err(ProviderError::Unexpected(format!(
                "expected one query embedding, received {}",
                vectors.len()
            )));
        }
        Ok(vectors.remove(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub image: Option<EncodedImage>,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
        }
    }

    pub fn with_image(prompt: impl Into<String>, image: EncodedImage) -> Self {
        Self {
            prompt: prompt.into(),
            image: Some(image),
        }
    }
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Raw generated text; may be empty.
    async fn generate(&self, key: &ApiKey, request: &GenerationRequest)
        -> Result<String, ProviderError>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Store embedded chunks. Chunks without an embedding are rejected.
    async fn add(&self, chunks: &[Chunk]) -> Result<(), StoreError>;

    /// Nearest chunks by descending similarity, restricted to `sources` when
    /// given.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        sources: Option<&[String]>,
    ) -> Result<Vec<RetrievedResult>, StoreError>;

    /// Drop every chunk whose `source` matches.
    async fn remove_source(&self, source: &str) -> Result<(), StoreError>;
}
