use crate::context::{PromptBuilder, NOT_AVAILABLE};
use crate::credentials::CredentialStrategy;
use crate::error::{AnswerError, ProviderError};
use crate::models::{ConversationTurn, RetrievedResult};
use crate::traits::{GenerationProvider, GenerationRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const EMPTY_ANSWER: &str =
    "No answer generated from the provided context. The API returned an empty response.";
pub const QUOTA_ANSWER: &str = "API quota exceeded. Please try again later or upgrade your plan.";

/// Exponential backoff for the model call: `base_delay * 2^(attempt - 1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

pub struct AnswerGenerator {
    model: Arc<dyn GenerationProvider>,
    keys: Arc<dyn CredentialStrategy>,
    prompts: PromptBuilder,
    retry: RetryPolicy,
}

impl AnswerGenerator {
    pub fn new(
        model: Arc<dyn GenerationProvider>,
        keys: Arc<dyn CredentialStrategy>,
        prompts: PromptBuilder,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            model,
            keys,
            prompts,
            retry,
        }
    }

    pub async fn generate_answer(
        &self,
        question: &str,
        retrieved: &[RetrievedResult],
        history: &[ConversationTurn],
    ) -> Result<String, AnswerError> {
        if retrieved.is_empty() {
            info!("no chunks retrieved for answer generation");
            return Ok(NOT_AVAILABLE.to_string());
        }

        let prompt = self.prompts.build(question, retrieved, history);
        debug!(chars = prompt.text.len(), degraded = prompt.degraded, "sending prompt");

        match self.call_with_retry(&GenerationRequest::text(prompt.text)).await {
            Ok(answer) => Ok(answer),
            Err((_, ProviderError::EmptyResponse)) => Ok(EMPTY_ANSWER.to_string()),
            Err((_, ProviderError::QuotaExceeded(message))) => {
                warn!(%message, "quota exceeded during answer generation");
                self.keys.next();
                Ok(QUOTA_ANSWER.to_string())
            }
            Err((attempts, source)) => {
                error!(attempts, error = %source, "answer generation failed");
                Err(AnswerError::Generation { attempts, source })
            }
        }
    }

    async fn call_with_retry(
        &self,
        request: &GenerationRequest,
    ) -> Result<String, (u32, ProviderError)> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let key = self.keys.current();
            let outcome = match self.model.generate(&key, request).await {
                Ok(text) if text.trim().is_empty() => Err(ProviderError::EmptyResponse),
                Ok(text) => Ok(text.trim().to_string()),
                Err(error) => Err(error),
            };

            match outcome {
                Ok(text) => {
                    info!(attempt, chars = text.len(), "model response received");
                    return Ok(text);
                }
                Err(error) if error.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(attempt, ?delay, %error, "model call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err((attempt, error)),
            }
        }
    }
}
