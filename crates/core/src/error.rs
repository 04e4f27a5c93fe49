use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("extraction worker failed: {0}")]
    Worker(String),
}

/// Failure reported by an embedding or generation provider, classified so
/// callers can pick a recovery (rotate, give up, retry) without string matching.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("provider returned an empty response")]
    EmptyResponse,

    #[error("malformed input: missing field `{field}`")]
    MalformedInput { field: String },

    #[error("unexpected provider error: {0}")]
    Unexpected(String),
}

impl ProviderError {
    /// Classify an HTTP failure from its status code and response body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("{status}: {}", body.trim());
        if status == 429 || mentions_quota(body) {
            ProviderError::QuotaExceeded(message)
        } else if matches!(status, 408 | 502 | 503 | 504) {
            ProviderError::TransientNetwork(message)
        } else {
            ProviderError::Unexpected(message)
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, ProviderError::QuotaExceeded(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::TransientNetwork(_) | ProviderError::Unexpected(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            return ProviderError::TransientNetwork(error.to_string());
        }
        match error.status() {
            Some(status) => ProviderError::from_status(status.as_u16(), &error.to_string()),
            None => ProviderError::Unexpected(error.to_string()),
        }
    }
}

impl From<url::ParseError> for ProviderError {
    fn from(error: url::ParseError) -> Self {
        ProviderError::Unexpected(format!("invalid provider url: {error}"))
    }
}

pub(crate) fn mentions_quota(message: &str) -> bool {
    message.to_ascii_lowercase().contains("quota")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum AnswerError {
    #[error("failed to generate answer after {attempts} attempt(s): {source}")]
    Generation {
        attempts: u32,
        #[source]
        source: ProviderError,
    },
}

/// Errors surfaced by the ingest and ask flows of the coordinator.
#[derive(Debug, Error)]
pub enum QaError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Answer(#[from] AnswerError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("embedding failed for {0}; retry once the provider recovers")]
    EmbeddingUnavailable(String),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
