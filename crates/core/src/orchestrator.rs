use crate::answer::{AnswerGenerator, RetryPolicy};
use crate::chunking::SentenceChunker;
use crate::config::Settings;
use crate::context::{PromptBuilder, NOT_AVAILABLE};
use crate::credentials::CredentialStrategy;
use crate::embeddings::EmbeddingGateway;
use crate::error::{ProviderError, QaError};
use crate::extractor::{source_name, PdfExtractor};
use crate::ingest::digest_file;
use crate::library::{BookRegistry, ConversationLog};
use crate::models::{BookRecord, ConversationTurn, RetrievedResult};
use crate::traits::{EmbeddingProvider, GenerationProvider, VectorStore};
use crate::vision::ImageTextExtractor;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Remote capabilities shared by every stage, all rotating the same keys.
#[derive(Clone)]
pub struct Providers {
    pub embeddings: Arc<dyn EmbeddingProvider>,
    pub generation: Arc<dyn GenerationProvider>,
    pub keys: Arc<dyn CredentialStrategy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested {
        source: String,
        text_chunks: usize,
        image_chunks: usize,
    },
    /// Same content was already ingested, possibly under another name.
    Duplicate { source: String },
    /// Nothing extractable; the book is not registered.
    Empty { source: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<String>,
}

/// Wires extraction, embedding, storage and answering into the two user
/// flows: ingest a book, ask a question.
pub struct BookQa {
    extractor: PdfExtractor,
    images: ImageTextExtractor,
    embeddings: EmbeddingGateway,
    store: Arc<dyn VectorStore>,
    answers: AnswerGenerator,
    top_k: usize,
}

impl BookQa {
    pub fn new(settings: &Settings, providers: Providers, store: Arc<dyn VectorStore>) -> Self {
        let chunker = SentenceChunker::new(settings.into());
        Self {
            extractor: PdfExtractor::from_settings(settings),
            images: ImageTextExtractor::new(
                providers.generation.clone(),
                providers.keys.clone(),
                chunker,
                settings.max_image_size,
            ),
            embeddings: EmbeddingGateway::new(providers.embeddings, providers.keys.clone()),
            store,
            answers: AnswerGenerator::new(
                providers.generation,
                providers.keys,
                PromptBuilder::from(settings),
                RetryPolicy::default(),
            ),
            top_k: settings.top_k.max(1),
        }
    }

    pub async fn ingest_book(
        &self,
        path: &Path,
        registry: &mut BookRegistry,
        include_images: bool,
    ) -> Result<IngestOutcome, QaError> {
        let source = source_name(path)?;
        let hash = digest_file(path)?;
        if registry.contains(&hash) {
            info!(source = %source, "book already processed");
            return Ok(IngestOutcome::Duplicate { source });
        }

        let extraction = self.extractor.extract(path).await?;
        let mut chunks = extraction.chunks;
        let text_chunks = chunks.len();
        if include_images && !extraction.images.is_empty() {
            chunks.extend(self.images.process_images(path, &extraction.images).await?);
        }
        let image_chunks = chunks.len() - text_chunks;

        if chunks.is_empty() {
            warn!(source = %source, "no text could be extracted");
            return Ok(IngestOutcome::Empty { source });
        }

        let embedded = self.embeddings.embed(chunks).await;
        if embedded.is_empty() {
            return Err(QaError::EmbeddingUnavailable(source));
        }

        self.store.add(&embedded).await?;
        registry.insert(&hash, &source)?;
        info!(source = %source, text_chunks, image_chunks, "book ingested");

        Ok(IngestOutcome::Ingested {
            source,
            text_chunks,
            image_chunks,
        })
    }

    /// Answer `question` from the selected books (all books when empty) and
    /// record both turns in `log`.
    pub async fn ask(
        &self,
        question: &str,
        books: &[String],
        log: &mut ConversationLog,
    ) -> Result<Answer, QaError> {
        let query = self.embeddings.embed_query(question).await?;
        let filter = (!books.is_empty()).then_some(books);
        let retrieved = self.store.query(&query, self.top_k, filter).await?;
        info!(retrieved = retrieved.len(), "retrieved chunks");

        let text = self
            .answers
            .generate_answer(question, &retrieved, log.turns())
            .await?;
        let sources = if text == NOT_AVAILABLE {
            Vec::new()
        } else {
            cite_sources(&retrieved)?
        };

        log.append(ConversationTurn::user(question))?;
        log.append(ConversationTurn::assistant(text.clone()))?;

        Ok(Answer { text, sources })
    }

    /// Drop a book's chunks from the store, then the book itself from the
    /// registry. A failed store call leaves the registry entry in place so the
    /// removal can be retried.
    pub async fn forget_book(
        &self,
        book: &str,
        registry: &mut BookRegistry,
    ) -> Result<Option<BookRecord>, QaError> {
        let Some(source) = registry.get(book).map(|record| record.name.clone()) else {
            return Ok(None);
        };
        self.store.remove_source(&source).await?;
        let removed = registry.remove(book)?;
        info!(source = %source, "book removed");
        Ok(removed)
    }
}

/// One `"<source> (Pages: [..])"` line per distinct retrieved location.
pub fn cite_sources(retrieved: &[RetrievedResult]) -> Result<Vec<String>, ProviderError> {
    let mut cited: Vec<String> = Vec::new();
    for result in retrieved {
        let source = result.source().ok_or_else(|| ProviderError::MalformedInput {
            field: "source".to_string(),
        })?;
        let pages = result
            .metadata
            .get("pages")
            .and_then(Value::as_array)
            .map(|pages| {
                pages
                    .iter()
                    .map(|page| page.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();

        let line = format!("{source} (Pages: [{pages}])");
        if !cited.contains(&line) {
            cited.push(line);
        }
    }
    Ok(cited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ApiKey, ApiKeyPool};
    use crate::embeddings::HashingEmbedder;
    use crate::error::StoreError;
    use crate::models::Chunk;
    use crate::stores::InMemoryVectorStore;
    use crate::test_support::write_pdf;
    use crate::traits::GenerationRequest;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct FixedModel {
        answer: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationProvider for FixedModel {
        async fn generate(
            &self,
            _key: &ApiKey,
            request: &GenerationRequest,
        ) -> Result<String, ProviderError> {
            self.prompts
                .lock()
                .expect("prompts lock")
                .push(request.prompt.clone());
            Ok(self.answer.clone())
        }
    }

    struct QuotaEmbedder;

    #[async_trait]
    impl EmbeddingProvider for QuotaEmbedder {
        async fn embed_batch(
            &self,
            _key: &ApiKey,
            _texts: &[&str],
        ) -> Result<Vec<Vec<f32>>, ProviderError> {
            Err(ProviderError::QuotaExceeded("429".to_string()))
        }
    }

    /// Delegates to an in-memory store but refuses every removal.
    struct StickyStore {
        inner: InMemoryVectorStore,
    }

    #[async_trait]
    impl VectorStore for StickyStore {
        async fn add(&self, chunks: &[Chunk]) -> Result<(), StoreError> {
            self.inner.add(chunks).await
        }

        async fn query(
            &self,
            vector: &[f32],
            k: usize,
            sources: Option<&[String]>,
        ) -> Result<Vec<RetrievedResult>, StoreError> {
            self.inner.query(vector, k, sources).await
        }

        async fn remove_source(&self, _source: &str) -> Result<(), StoreError> {
            Err(StoreError::Request("delete rejected".to_string()))
        }
    }

    fn fixed_model(answer: &str) -> Arc<FixedModel> {
        Arc::new(FixedModel {
            answer: answer.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn book_qa(
        embeddings: Arc<dyn EmbeddingProvider>,
        model: Arc<FixedModel>,
        store: Arc<dyn VectorStore>,
    ) -> Result<BookQa, Box<dyn std::error::Error>> {
        let settings = Settings {
            max_workers: 2,
            ..Settings::default()
        };
        let providers = Providers {
            embeddings,
            generation: model,
            keys: Arc::new(ApiKeyPool::new(["key-a", "key-b"])?),
        };
        Ok(BookQa::new(&settings, providers, store))
    }

    #[tokio::test]
    async fn ingest_then_ask_cites_the_book() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pdf = dir.path().join("pumps.pdf");
        write_pdf(&pdf, &["Centrifugal pumps move fluid.", "Valves stop flow."], &[])?;

        let store = Arc::new(InMemoryVectorStore::new());
        let model = fixed_model("Pumps move fluid.");
        let qa = book_qa(Arc::new(HashingEmbedder::default()), model.clone(), store.clone())?;
        let mut registry = BookRegistry::open(dir.path(), "ana")?;
        let mut log = ConversationLog::open(dir.path(), "ana")?;

        let outcome = qa.ingest_book(&pdf, &mut registry, false).await?;
        assert!(matches!(outcome, IngestOutcome::Ingested { text_chunks: 1, .. }));
        assert_eq!(registry.names(), vec!["pumps.pdf".to_string()]);

        let again = qa.ingest_book(&pdf, &mut registry, false).await?;
        assert_eq!(
            again,
            IngestOutcome::Duplicate {
                source: "pumps.pdf".to_string()
            }
        );
        assert_eq!(store.len().await, 1);

        let answer = qa.ask("What do pumps do?", &[], &mut log).await?;
        assert_eq!(answer.text, "Pumps move fluid.");
        assert_eq!(answer.sources, vec!["pumps.pdf (Pages: [1, 2])".to_string()]);
        assert_eq!(
            log.turns(),
            &[
                ConversationTurn::user("What do pumps do?"),
                ConversationTurn::assistant("Pumps move fluid."),
            ]
        );

        let prompts = model.prompts.lock().expect("prompts lock");
        assert!(prompts[0].contains("[Text from Page 1]"));
        Ok(())
    }

    #[tokio::test]
    async fn filtered_or_forgotten_books_yield_not_available() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempdir()?;
        let pdf = dir.path().join("pumps.pdf");
        write_pdf(&pdf, &["Centrifugal pumps move fluid."], &[])?;

        let store = Arc::new(InMemoryVectorStore::new());
        let model = fixed_model("unused");
        let qa = book_qa(Arc::new(HashingEmbedder::default()), model.clone(), store.clone())?;
        let mut registry = BookRegistry::open(dir.path(), "ana")?;
        let mut log = ConversationLog::open(dir.path(), "ana")?;
        qa.ingest_book(&pdf, &mut registry, false).await?;

        let other = ["valves.pdf".to_string()];
        let answer = qa.ask("What do pumps do?", &other, &mut log).await?;
        assert_eq!(answer.text, NOT_AVAILABLE);
        assert!(answer.sources.is_empty());

        let removed = qa.forget_book("pumps.pdf", &mut registry).await?;
        assert_eq!(removed.map(|record| record.name), Some("pumps.pdf".to_string()));
        assert!(store.is_empty().await);

        let answer = qa.ask("What do pumps do?", &[], &mut log).await?;
        assert_eq!(answer.text, NOT_AVAILABLE);
        assert!(model.prompts.lock().expect("prompts lock").is_empty());
        assert_eq!(log.turns().len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn failed_embedding_leaves_store_and_registry_untouched(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pdf = dir.path().join("pumps.pdf");
        write_pdf(&pdf, &["Centrifugal pumps move fluid."], &[])?;

        let store = Arc::new(InMemoryVectorStore::new());
        let qa = book_qa(Arc::new(QuotaEmbedder), fixed_model("unused"), store.clone())?;
        let mut registry = BookRegistry::open(dir.path(), "ana")?;

        let error = qa.ingest_book(&pdf, &mut registry, false).await;
        assert!(matches!(error, Err(QaError::EmbeddingUnavailable(source)) if source == "pumps.pdf"));
        assert!(store.is_empty().await);
        assert!(registry.names().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_store_removal_keeps_the_book_registered(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let pdf = dir.path().join("pumps.pdf");
        write_pdf(&pdf, &["Centrifugal pumps move fluid."], &[])?;

        let store = Arc::new(StickyStore {
            inner: InMemoryVectorStore::new(),
        });
        let qa = book_qa(
            Arc::new(HashingEmbedder::default()),
            fixed_model("unused"),
            store.clone(),
        )?;
        let mut registry = BookRegistry::open(dir.path(), "ana")?;
        qa.ingest_book(&pdf, &mut registry, false).await?;

        let result = qa.forget_book("pumps.pdf", &mut registry).await;
        assert!(matches!(result, Err(QaError::Store(_))));
        assert_eq!(registry.names(), vec!["pumps.pdf".to_string()]);
        assert_eq!(
            BookRegistry::open(dir.path(), "ana")?.names(),
            vec!["pumps.pdf".to_string()]
        );
        assert_eq!(store.inner.len().await, 1);
        Ok(())
    }

    #[test]
    fn citations_require_a_source() {
        let mut metadata = Map::new();
        metadata.insert("pages".to_string(), json!([3]));
        let missing = RetrievedResult {
            text: "x".to_string(),
            metadata: metadata.clone(),
            score: 1.0,
        };
        assert_eq!(
            cite_sources(&[missing]),
            Err(ProviderError::MalformedInput {
                field: "source".to_string()
            })
        );

        metadata.insert("source".to_string(), json!("a.pdf"));
        let hit = RetrievedResult {
            text: "x".to_string(),
            metadata,
            score: 1.0,
        };
        assert_eq!(
            cite_sources(&[hit.clone(), hit]),
            Ok(vec!["a.pdf (Pages: [3])".to_string()])
        );
    }
}
