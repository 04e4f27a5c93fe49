use super::{cosine_similarity, matches_sources};
use crate::error::StoreError;
use crate::models::{Chunk, RetrievedResult};
use crate::traits::VectorStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    id: String,
    text: String,
    metadata: Map<String, Value>,
    vector: Vec<f32>,
}

/// Brute-force cosine store, optionally mirrored to a JSON file after every
/// write.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<Vec<StoredEntry>>,
    path: Option<PathBuf>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the store persisted at `path`, or start empty if it does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(error) => return Err(error.into()),
        };

        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn persist(&self, entries: &[StoredEntry]) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec(entries)?;
            tokio::fs::write(path, bytes).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, chunks: &[Chunk]) -> Result<(), StoreError> {
        let mut incoming = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let vector = chunk.embedding.clone().ok_or_else(|| {
                StoreError::Request(format!("chunk {} has no embedding", chunk.chunk_id()))
            })?;
            incoming.push(StoredEntry {
                id: chunk.chunk_id(),
                text: chunk.text.clone(),
                metadata: chunk.metadata_map(),
                vector,
            });
        }

        let mut entries = self.entries.write().await;
        if let Some(dimensions) = entries.first().map(|entry| entry.vector.len()) {
            if let Some(bad) = incoming.iter().find(|entry| entry.vector.len() != dimensions) {
                return Err(StoreError::Request(format!(
                    "embedding dimension {} != {}",
                    bad.vector.len(),
                    dimensions
                )));
            }
        }

        let added = incoming.len();
        for entry in incoming {
            match entries.iter_mut().find(|existing| existing.id == entry.id) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
        }
        self.persist(&entries).await?;
        info!(added, total = entries.len(), "stored chunks");
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        sources: Option<&[String]>,
    ) -> Result<Vec<RetrievedResult>, StoreError> {
        let entries = self.entries.read().await;
        let mut scored: Vec<RetrievedResult> = entries
            .iter()
            .filter(|entry| {
                matches_sources(entry.metadata.get("source").and_then(Value::as_str), sources)
            })
            .map(|entry| RetrievedResult {
                text: entry.text.clone(),
                metadata: entry.metadata.clone(),
                score: cosine_similarity(vector, &entry.vector),
            })
            .collect();

        scored.sort_by(|left, right| right.score.total_cmp(&left.score));
        scored.truncate(k);
        Ok(scored)
    }

    async fn remove_source(&self, source: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.retain(|entry| entry.metadata.get("source").and_then(Value::as_str) != Some(source));
        self.persist(&entries).await
    }
}
