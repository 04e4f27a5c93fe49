use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Text,
    Image,
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkKind::Text => f.write_str("text"),
            ChunkKind::Image => f.write_str("image"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub source: String,
    pub pages: Vec<u32>,
    #[serde(rename = "type")]
    pub kind: ChunkKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub metadata: ChunkMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn new(text: impl Into<String>, metadata: ChunkMetadata) -> Self {
        Self {
            text: text.into(),
            metadata,
            embedding: None,
        }
    }

    /// Content-derived id, stable across re-ingestion of the same book.
    pub fn chunk_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.metadata.source.as_bytes());
        for page in &self.metadata.pages {
            hasher.update(page.to_le_bytes());
        }
        hasher.update(self.metadata.kind.to_string().as_bytes());
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn metadata_map(&self) -> Map<String, Value> {
        match serde_json::to_value(&self.metadata) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// An image XObject on a page that passed the triviality filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageImageRef {
    pub page_index: u32,
    pub object_id: (u32, u16),
}

impl PageImageRef {
    pub fn page_number(&self) -> u32 {
        self.page_index + 1
    }
}

/// Image bytes in a format a vision model accepts.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

impl fmt::Debug for EncodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedImage")
            .field("len", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedResult {
    pub text: String,
    pub metadata: Map<String, Value>,
    pub score: f32,
}

impl RetrievedResult {
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookRecord {
    pub name: String,
    pub ingested_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> ChunkMetadata {
        ChunkMetadata {
            source: "book.pdf".to_string(),
            pages: vec![3, 4],
            kind: ChunkKind::Text,
        }
    }

    #[test]
    fn metadata_serializes_kind_as_type() {
        let chunk = Chunk::new("Hello.", metadata());
        let map = chunk.metadata_map();
        assert_eq!(map.get("type"), Some(&Value::from("text")));
        assert_eq!(map.get("source"), Some(&Value::from("book.pdf")));
    }

    #[test]
    fn chunk_id_depends_on_pages() {
        let first = Chunk::new("Hello.", metadata());
        let mut other = metadata();
        other.pages = vec![5];
        let second = Chunk::new("Hello.", other);
        assert_ne!(first.chunk_id(), second.chunk_id());
        assert_eq!(first.chunk_id(), Chunk::new("Hello.", metadata()).chunk_id());
    }
}
