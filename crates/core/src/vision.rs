use crate::chunking::SentenceChunker;
use crate::credentials::CredentialStrategy;
use crate::error::{IngestError, ProviderError};
use crate::extractor::{encode_image, load_document, source_name};
use crate::models::{Chunk, ChunkKind, EncodedImage, PageImageRef};
use crate::traits::{GenerationProvider, GenerationRequest};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const IMAGE_PROMPT: &str = "Extract text from this image:";

/// Recovers text embedded in page images through a vision-capable model.
///
/// Calls and key rotation are serialized by one lock shared by every clone
/// of the extractor.
#[derive(Clone)]
pub struct ImageTextExtractor {
    model: Arc<dyn GenerationProvider>,
    keys: Arc<dyn CredentialStrategy>,
    chunker: SentenceChunker,
    max_image_size: usize,
    call_lock: Arc<Mutex<()>>,
}

impl ImageTextExtractor {
    pub fn new(
        model: Arc<dyn GenerationProvider>,
        keys: Arc<dyn CredentialStrategy>,
        chunker: SentenceChunker,
        max_image_size: usize,
    ) -> Self {
        Self {
            model,
            keys,
            chunker,
            max_image_size,
            call_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Re-open the PDF, decode every referenced image and extract its text.
    pub async fn process_images(
        &self,
        path: &Path,
        refs: &[PageImageRef],
    ) -> Result<Vec<Chunk>, IngestError> {
        let source = source_name(path)?;
        let owned = path.to_path_buf();
        let refs = refs.to_vec();

        let images = tokio::task::spawn_blocking(move || {
            let document = load_document(&owned)?;
            let decoded = refs
                .iter()
                .filter_map(|image_ref| match encode_image(&document, image_ref.object_id) {
                    Some(image) => Some((image_ref.page_index, image)),
                    None => {
                        warn!(page = image_ref.page_number(), "image could not be decoded");
                        None
                    }
                })
                .collect::<Vec<_>>();
            Ok::<_, IngestError>(decoded)
        })
        .await
        .map_err(|error| IngestError::Worker(error.to_string()))??;

        Ok(self.extract_from_images(&source, images).await)
    }

    /// Extract text from decoded images, each paired with its 0-based page
    /// index. Failures skip the image; they never abort the batch.
    pub async fn extract_from_images(
        &self,
        source: &str,
        images: Vec<(u32, EncodedImage)>,
    ) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        for (page_index, image) in images {
            let page = page_index + 1;
            if image.bytes.len() > self.max_image_size {
                warn!(
                    page,
                    bytes = image.bytes.len(),
                    limit = self.max_image_size,
                    "image exceeds size limit"
                );
                continue;
            }

            let extracted = match self.describe(image).await {
                Ok(text) => text,
                Err(error) => {
                    error!(page, %error, "failed to process image");
                    continue;
                }
            };
            info!(page, chars = extracted.len(), "extracted text from image");

            if extracted.trim().is_empty() {
                continue;
            }
            let text = format!("[Image Text from Page {page}]:\n{extracted}");
            chunks.extend(self.chunker.chunk(&text, source, &[page], ChunkKind::Image));
        }

        chunks
    }

    async fn describe(&self, image: EncodedImage) -> Result<String, ProviderError> {
        let _guard = self.call_lock.lock().await;
        let key = self.keys.current();
        let request = GenerationRequest::with_image(IMAGE_PROMPT, image);

        match self.model.generate(&key, &request).await {
            Ok(text) => Ok(text),
            Err(error) => {
                if error.is_quota() {
                    self.keys.next();
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkingConfig;
    use crate::credentials::{ApiKey, ApiKeyPool};
    use crate::test_support::{noise, write_pdf, TestImage};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct ScriptedVision {
        outcomes: StdMutex<VecDeque<Result<String, ProviderError>>>,
        calls: StdMutex<Vec<(String, String)>>,
    }

    impl ScriptedVision {
        fn new(outcomes: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                outcomes: StdMutex::new(outcomes.into()),
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn keys_used(&self) -> Vec<String> {
            self.calls
                .lock()
                .expect("calls lock")
                .iter()
                .map(|(key, _)| key.clone())
                .collect()
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedVision {
        async fn generate(
            &self,
            key: &ApiKey,
            request: &GenerationRequest,
        ) -> Result<String, ProviderError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((key.expose().to_string(), request.prompt.clone()));
            self.outcomes
                .lock()
                .expect("outcomes lock")
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    fn image(len: usize) -> EncodedImage {
        EncodedImage {
            bytes: vec![7; len],
            mime_type: "image/png",
        }
    }

    fn extractor(vision: Arc<ScriptedVision>, max_image_size: usize) -> (ImageTextExtractor, Arc<ApiKeyPool>) {
        let pool = Arc::new(ApiKeyPool::new(["key-a", "key-b"]).expect("pool"));
        let extractor = ImageTextExtractor::new(
            vision,
            pool.clone(),
            SentenceChunker::new(ChunkingConfig::default()),
            max_image_size,
        );
        (extractor, pool)
    }

    #[tokio::test]
    async fn text_becomes_single_page_image_chunks() {
        let vision = Arc::new(ScriptedVision::new(vec![Ok("Figure 3. Pump curve.".to_string())]));
        let (extractor, _) = extractor(vision.clone(), 5_000_000);

        let chunks = extractor
            .extract_from_images("book.pdf", vec![(4, image(2_000))])
            .await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.pages, vec![5]);
        assert_eq!(chunks[0].metadata.kind, ChunkKind::Image);
        assert!(chunks[0].text.starts_with("[Image Text from Page 5]:"));
        assert_eq!(vision.calls.lock().expect("calls").len(), 1);
        assert_eq!(vision.calls.lock().expect("calls")[0].1, IMAGE_PROMPT);
    }

    #[tokio::test]
    async fn oversized_images_are_skipped_without_a_call() {
        let vision = Arc::new(ScriptedVision::new(vec![Ok("unused".to_string())]));
        let (extractor, _) = extractor(vision.clone(), 1_500);

        let chunks = extractor
            .extract_from_images("book.pdf", vec![(0, image(2_000))])
            .await;

        assert!(chunks.is_empty());
        assert!(vision.keys_used().is_empty());
    }

    #[tokio::test]
    async fn quota_error_rotates_key_and_continues() {
        let vision = Arc::new(ScriptedVision::new(vec![
            Err(ProviderError::QuotaExceeded("429".to_string())),
            Ok("Recovered text.".to_string()),
        ]));
        let (extractor, pool) = extractor(vision.clone(), 5_000_000);

        let chunks = extractor
            .extract_from_images("book.pdf", vec![(0, image(2_000)), (1, image(2_000))])
            .await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.pages, vec![2]);
        assert_eq!(vision.keys_used(), vec!["key-a", "key-b"]);
        assert_eq!(pool.current().expose(), "key-b");
    }

    #[tokio::test]
    async fn other_errors_skip_only_that_image() {
        let vision = Arc::new(ScriptedVision::new(vec![
            Err(ProviderError::Unexpected("decode failed".to_string())),
            Ok("   ".to_string()),
            Ok("Caption text.".to_string()),
        ]));
        let (extractor, pool) = extractor(vision.clone(), 5_000_000);

        let chunks = extractor
            .extract_from_images(
                "book.pdf",
                vec![(0, image(2_000)), (1, image(2_000)), (2, image(2_000))],
            )
            .await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.pages, vec![3]);
        assert_eq!(pool.current().expose(), "key-a");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn process_images_decodes_refs_from_the_pdf() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("figures.pdf");
        write_pdf(
            &path,
            &["Page with a figure."],
            &[TestImage {
                page_index: 0,
                width: 64,
                height: 64,
                pixels: noise(64 * 64),
            }],
        )?;

        let extraction = crate::extractor::PdfExtractor::new(
            SentenceChunker::new(ChunkingConfig::default()),
            10,
            1,
        )
        .extract(&path)
        .await?;
        assert_eq!(extraction.images.len(), 1);

        let vision = Arc::new(ScriptedVision::new(vec![Ok("Label: valve A.".to_string())]));
        let (extractor, _) = extractor(vision, 5_000_000);
        let chunks = extractor.process_images(&path, &extraction.images).await?;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.source, "figures.pdf");
        assert_eq!(chunks[0].metadata.pages, vec![1]);
        Ok(())
    }
}
