use super::matches_sources;
use crate::error::StoreError;
use crate::models::{Chunk, RetrievedResult};
use crate::traits::VectorStore;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantStore {
    pub fn new(endpoint: impl Into<String>, collection: impl Into<String>, vector_size: usize) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        let response = self.client.get(self.collection_url()).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(response.status()));
        }

        let response = self
            .client
            .put(self.collection_url())
            .json(&json!({
                "vectors": { "size": self.vector_size, "distance": "Cosine" }
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }
        Ok(())
    }
}

fn backend_error(status: StatusCode) -> StoreError {
    StoreError::BackendResponse {
        backend: "qdrant".to_string(),
        details: status.to_string(),
    }
}

/// Qdrant point ids must be integers or UUIDs; derive a stable UUID from the
/// content hash so re-ingestion upserts.
fn point_id(chunk: &Chunk) -> Result<Uuid, StoreError> {
    let digest = chunk.chunk_id();
    Uuid::parse_str(&digest[..32]).map_err(|error| StoreError::Request(error.to_string()))
}

fn source_filter(sources: &[String]) -> Value {
    json!({
        "must": [{ "key": "source", "match": { "any": sources } }]
    })
}

pub(crate) fn parse_hits(parsed: &Value) -> Vec<RetrievedResult> {
    parsed
        .pointer("/result")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .map(|hit| {
                    let mut metadata = hit
                        .pointer("/payload")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_else(Map::new);
                    let text = metadata
                        .remove("text")
                        .and_then(|text| text.as_str().map(str::to_string))
                        .unwrap_or_default();
                    RetrievedResult {
                        text,
                        metadata,
                        score: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn add(&self, chunks: &[Chunk]) -> Result<(), StoreError> {
        let points = chunks
            .iter()
            .map(|chunk| {
                let embedding = chunk.embedding.as_ref().ok_or_else(|| {
                    StoreError::Request(format!("chunk {} has no embedding", chunk.chunk_id()))
                })?;
                if embedding.len() != self.vector_size {
                    return Err(StoreError::Request(format!(
                        "embedding dimension {} != {}",
                        embedding.len(),
                        self.vector_size
                    )));
                }

                let mut payload = chunk.metadata_map();
                payload.insert("text".to_string(), Value::from(chunk.text.clone()));

                Ok(json!({
                    "id": point_id(chunk)?,
                    "vector": embedding,
                    "payload": payload,
                }))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        sources: Option<&[String]>,
    ) -> Result<Vec<RetrievedResult>, StoreError> {
        if vector.len() != self.vector_size {
            return Err(StoreError::Request(format!(
                "query vector dim {} is not {}",
                vector.len(),
                self.vector_size
            )));
        }

        let mut body = json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(sources) = sources {
            body["filter"] = source_filter(sources);
        }

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let parsed: Value = response.json().await?;
        // Re-filtered by `source` locally as well.
        Ok(parse_hits(&parsed)
            .into_iter()
            .filter(|hit| matches_sources(hit.source(), sources))
            .collect())
    }

    async fn remove_source(&self, source: &str) -> Result<(), StoreError> {
        let response = self
            .client
            .post(format!("{}/points/delete?wait=true", self.collection_url()))
            .json(&json!({ "filter": source_filter(&[source.to_string()]) }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkKind, ChunkMetadata};

    #[test]
    fn point_ids_are_stable_uuids() -> Result<(), StoreError> {
        let chunk = Chunk::new(
            "Stable.",
            ChunkMetadata {
                source: "a.pdf".to_string(),
                pages: vec![1],
                kind: ChunkKind::Text,
            },
        );
        assert_eq!(point_id(&chunk)?, point_id(&chunk.clone())?);
        Ok(())
    }

    #[test]
    fn hits_move_text_out_of_payload() {
        let parsed = json!({
            "result": [{
                "id": "00000000-0000-0000-0000-000000000001",
                "score": 0.75,
                "payload": { "text": "Body.", "source": "a.pdf", "pages": [2], "type": "text" }
            }]
        });
        let hits = parse_hits(&parsed);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "Body.");
        assert_eq!(hits[0].source(), Some("a.pdf"));
        assert!(hits[0].metadata.get("text").is_none());
        assert!((hits[0].score - 0.75).abs() < f32::EPSILON);
    }
}
