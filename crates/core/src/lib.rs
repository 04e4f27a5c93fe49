pub mod answer;
pub mod chunking;
pub mod config;
pub mod context;
pub mod credentials;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod gemini;
pub mod ingest;
pub mod library;
pub mod models;
pub mod orchestrator;
pub mod stores;
pub mod traits;
pub mod vision;

#[cfg(test)]
mod test_support;

pub use answer::{AnswerGenerator, RetryPolicy, EMPTY_ANSWER, QUOTA_ANSWER};
pub use chunking::{truncate_at_sentence, ChunkingConfig, SentenceChunker};
pub use config::Settings;
pub use context::{build_context, build_history, PromptBuilder, NOT_AVAILABLE};
pub use credentials::{ApiKey, ApiKeyPool, CredentialStrategy};
pub use embeddings::{EmbeddingGateway, HashingEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{AnswerError, IngestError, ProviderError, QaError, StoreError};
pub use extractor::{Extraction, PdfExtractor};
pub use gemini::GeminiClient;
pub use ingest::{digest_file, discover_pdf_files};
pub use library::{AccountFile, BookRegistry, ConversationLog};
pub use models::{
    BookRecord, Chunk, ChunkKind, ChunkMetadata, ConversationTurn, EncodedImage, PageImageRef,
    RetrievedResult, Role,
};
pub use orchestrator::{cite_sources, Answer, BookQa, IngestOutcome, Providers};
pub use stores::{InMemoryVectorStore, QdrantStore};
pub use traits::{EmbeddingProvider, GenerationProvider, GenerationRequest, VectorStore};
pub use vision::ImageTextExtractor;
