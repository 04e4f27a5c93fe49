//! API credentials shared by every component that talks to a provider.

use crate::error::IngestError;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::info;

#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail: String = self
            .0
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        write!(f, "ApiKey(..{tail})")
    }
}

/// Chooses which credential a provider call uses.
///
/// `next` is called after a quota error and returns the credential to use
/// from now on.
pub trait CredentialStrategy: Send + Sync {
    fn current(&self) -> ApiKey;

    fn next(&self) -> ApiKey;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Round-robin failover over a fixed list of keys.
pub struct ApiKeyPool {
    keys: Vec<ApiKey>,
    index: Mutex<usize>,
}

impl ApiKeyPool {
    pub fn new<I, S>(keys: I) -> Result<Self, IngestError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<ApiKey> = keys
            .into_iter()
            .map(Into::into)
            .filter(|key: &String| !key.trim().is_empty())
            .map(ApiKey::new)
            .collect();

        if keys.is_empty() {
            return Err(IngestError::InvalidConfig(
                "no valid Gemini API key provided".to_string(),
            ));
        }

        Ok(Self {
            keys,
            index: Mutex::new(0),
        })
    }

    pub fn current_index(&self) -> usize {
        *self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CredentialStrategy for ApiKeyPool {
    fn current(&self) -> ApiKey {
        let index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        self.keys[*index].clone()
    }

    fn next(&self) -> ApiKey {
        let mut index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        *index = (*index + 1) % self.keys.len();
        info!(key = *index + 1, total = self.keys.len(), "switched api key");
        self.keys[*index].clone()
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}
