use crate::error::IngestError;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/";
pub const DEFAULT_GENERATION_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_EMBEDDING_MODEL: &str = "embedding-001";

const API_KEY_VARS: [&str; 3] = ["GEMINI_API_KEY", "GEMINI_API_KEY_1", "GEMINI_API_KEY_2"];

#[derive(Debug, Clone)]
pub struct Settings {
    pub chunk_size: usize,
    pub overlap: usize,
    pub page_batch_size: usize,
    pub max_image_size: usize,
    pub max_workers: usize,
    pub context_chars: usize,
    pub history_chars: usize,
    pub token_budget: usize,
    pub top_k: usize,
    pub api_keys: Vec<String>,
    pub gemini_base_url: String,
    pub generation_model: String,
    pub embedding_model: String,
    pub request_timeout: Duration,
    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            overlap: 0,
            page_batch_size: 50,
            max_image_size: 5_000_000,
            max_workers: default_workers(),
            context_chars: 2_000,
            history_chars: 1_000,
            token_budget: 4_000,
            top_k: 10,
            api_keys: Vec::new(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            generation_model: DEFAULT_GENERATION_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            request_timeout: Duration::from_secs(60),
            data_dir: PathBuf::from("."),
        }
    }
}

impl Settings {
    /// Defaults overridden by `GEMINI_API_KEY*` and `BOOKQA_*` variables.
    pub fn from_env() -> Result<Self, IngestError> {
        let mut settings = Self::default();

        settings.api_keys = API_KEY_VARS
            .iter()
            .filter_map(|name| non_empty_var(name))
            .collect();

        if let Some(value) = parse_var("BOOKQA_CHUNK_SIZE")? {
            settings.chunk_size = value;
        }
        if let Some(value) = parse_var("BOOKQA_PAGE_BATCH_SIZE")? {
            settings.page_batch_size = value;
        }
        if let Some(value) = parse_var("BOOKQA_MAX_WORKERS")? {
            settings.max_workers = value;
        }
        if let Some(dir) = non_empty_var("BOOKQA_DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = non_empty_var("GEMINI_BASE_URL") {
            settings.gemini_base_url = url;
        }

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.page_batch_size == 0 {
            return Err(IngestError::InvalidConfig(
                "page_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(IngestError::InvalidConfig(
                "max_workers must be greater than zero".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::InvalidConfig(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    pub fn require_api_keys(&self) -> Result<&[String], IngestError> {
        if self.api_keys.is_empty() {
            return Err(IngestError::InvalidConfig(
                "no Gemini API key provided; set GEMINI_API_KEY_1 or pass --api-key".to_string(),
            ));
        }
        Ok(&self.api_keys)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let value = value.trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

fn parse_var(name: &str) -> Result<Option<usize>, IngestError> {
    match non_empty_var(name) {
        Some(raw) => raw
            .parse::<usize>()
            .map(Some)
            .map_err(|error| IngestError::InvalidConfig(format!("{name}={raw}: {error}"))),
        None => Ok(None),
    }
}
