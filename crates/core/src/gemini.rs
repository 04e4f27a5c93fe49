//! Gemini REST client for embeddings and (vision) generation.

use crate::config::Settings;
use crate::credentials::ApiKey;
use crate::error::ProviderError;
use crate::traits::{EmbeddingProvider, GenerationProvider, GenerationRequest};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Largest `batchEmbedContents` request the API accepts.
pub const MAX_EMBED_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: Url,
    generation_model: String,
    embedding_model: String,
}

impl GeminiClient {
    pub fn new(
        base_url: &str,
        generation_model: impl Into<String>,
        embedding_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ProviderError::Unexpected(format!("http client: {error}")))?;

        Ok(Self {
            client,
            base_url,
            generation_model: generation_model.into(),
            embedding_model: embedding_model.into(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ProviderError> {
        Self::new(
            &settings.gemini_base_url,
            settings.generation_model.clone(),
            settings.embedding_model.clone(),
            settings.request_timeout,
        )
    }

    fn endpoint(&self, model: &str, method: &str, key: &ApiKey) -> Result<Url, ProviderError> {
        let mut url = self
            .base_url
            .join(&format!("v1beta/models/{model}:{method}"))?;
        url.query_pairs_mut().append_pair("key", key.expose());
        Ok(url)
    }

    async fn post<B, R>(&self, url: Url, body: &B) -> Result<R, ProviderError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &text));
        }
        Ok(response.json::<R>().await?)
    }
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest<'a> {
    requests: Vec<EmbedContentRequest<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest<'a> {
    model: String,
    content: Content<'a>,
    task_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct Part<'a> {
    text: Option<&'a str>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

fn text_part(text: &str) -> Part<'_> {
    Part {
        text: Some(text),
        inline_data: None,
    }
}

fn generate_body(request: &GenerationRequest) -> GenerateRequest<'_> {
    let mut parts = vec![text_part(&request.prompt)];
    if let Some(image) = &request.image {
        parts.push(Part {
            text: None,
            inline_data: Some(InlineData {
                mime_type: image.mime_type,
                data: STANDARD.encode(&image.bytes),
            }),
        });
    }
    GenerateRequest {
        contents: vec![Content { parts }],
    }
}

fn response_text(response: GenerateResponse) -> String {
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

impl GeminiClient {
    /// Sends `texts` in order, at most [`MAX_EMBED_BATCH`] per request; any
    /// failed request fails the whole call.
    async fn embed_with_task(
        &self,
        key: &ApiKey,
        texts: &[&str],
        task_type: &'static str,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let model = format!("models/{}", self.embedding_model);
        let url = self.endpoint(&self.embedding_model, "batchEmbedContents", key)?;
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(MAX_EMBED_BATCH) {
            let body = BatchEmbedRequest {
                requests: batch
                    .iter()
                    .map(|text| EmbedContentRequest {
                        model: model.clone(),
                        content: Content {
                            parts: vec![text_part(text)],
                        },
                        task_type,
                    })
                    .collect(),
            };

            debug!(batch = batch.len(), task_type, model = %self.embedding_model, "embedding batch");
            let response: BatchEmbedResponse = self.post(url.clone(), &body).await?;
            if response.embeddings.len() != batch.len() {
                return Err(ProviderError::Unexpected(format!(
                    "requested {} embeddings, received {}",
                    batch.len(),
                    response.embeddings.len()
                )));
            }
            vectors.extend(response.embeddings.into_iter().map(|embedding| embedding.values));
        }

        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiClient {
    async fn embed_batch(
        &self,
        key: &ApiKey,
        texts: &[&str],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.embed_with_task(key, texts, "RETRIEVAL_DOCUMENT").await
    }

    async fn embed_query(&self, key: &ApiKey, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed_with_task(key, &[text], "RETRIEVAL_QUERY").await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::Unexpected("no query embedding returned".to_string()))
    }
}

#[async_trait]
impl GenerationProvider for GeminiClient {
    async fn generate(
        &self,
        key: &ApiKey,
        request: &GenerationRequest,
    ) -> Result<String, ProviderError> {
        let url = self.endpoint(&self.generation_model, "generateContent", key)?;
        let body = generate_body(request);
        let response: GenerateResponse = self.post(url, &body).await?;
        Ok(response_text(response))
    }
}
