use crate::config::Settings;
use crate::models::{Chunk, ChunkKind, ChunkMetadata};
use unicode_segmentation::UnicodeSegmentation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            overlap: 0,
        }
    }
}

impl From<&Settings> for ChunkingConfig {
    fn from(value: &Settings) -> Self {
        Self {
            chunk_size: value.chunk_size,
            overlap: value.overlap,
        }
    }
}

/// Packs whole sentences into chunks of at most `chunk_size` characters.
///
/// A sentence longer than `chunk_size` becomes a chunk of its own; sentences
/// are never split.
#[derive(Debug, Clone, Copy, Default)]
pub struct SentenceChunker {
    config: ChunkingConfig,
}

impl SentenceChunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn chunk(&self, text: &str, source: &str, pages: &[u32], kind: ChunkKind) -> Vec<Chunk> {
        pack_sentences(text, self.config)
            .into_iter()
            .map(|piece| {
                Chunk::new(
                    piece,
                    ChunkMetadata {
                        source: source.to_string(),
                        pages: pages.to_vec(),
                        kind,
                    },
                )
            })
            .collect()
    }
}

/// Trimmed, non-blank sentence units of `text` (UAX #29 sentence boundaries).
pub fn split_sentences(text: &str) -> Vec<&str> {
    text.split_sentence_bounds()
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .collect()
}

pub fn pack_sentences(text: &str, config: ChunkingConfig) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    for sentence in split_sentences(text) {
        let len = char_len(sentence);

        if current.is_empty() {
            current.push(sentence);
            current_len = len;
            continue;
        }

        if current_len + 1 + len <= config.chunk_size {
            current.push(sentence);
            current_len += 1 + len;
            continue;
        }

        pieces.push(current.join(" "));
        current = overlap_seed(&current, config, len);
        current_len = joined_len(&current);
        if current_len > 0 {
            current_len += 1;
        }
        current.push(sentence);
        current_len += len;
    }

    if !current.is_empty() {
        pieces.push(current.join(" "));
    }

    pieces
}

// Trailing sentences of the flushed chunk that are carried into the next one.
fn overlap_seed<'a>(previous: &[&'a str], config: ChunkingConfig, incoming: usize) -> Vec<&'a str> {
    if config.overlap == 0 {
        return Vec::new();
    }

    let mut seed = Vec::new();
    let mut seed_len = 0usize;
    for sentence in previous.iter().rev() {
        let extra = char_len(sentence) + usize::from(!seed.is_empty());
        if seed_len + extra > config.overlap {
            break;
        }
        seed.push(*sentence);
        seed_len += extra;
    }
    seed.reverse();

    if seed.is_empty() || seed_len + 1 + incoming > config.chunk_size {
        return Vec::new();
    }
    seed
}

fn joined_len(sentences: &[&str]) -> usize {
    if sentences.is_empty() {
        return 0;
    }
    sentences.iter().map(|s| char_len(s)).sum::<usize>() + sentences.len() - 1
}

pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn is_sentence_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// `text` itself when it fits, else its longest prefix within `max_length`
/// characters that ends on a sentence terminator. `None` when no terminator
/// exists inside the limit.
pub fn sentence_prefix(text: &str, max_length: usize) -> Option<&str> {
    let cut = match text.char_indices().nth(max_length) {
        Some((index, _)) => index,
        None => return Some(text),
    };

    let window = &text[..cut];
    window
        .rfind(is_sentence_terminator)
        .map(|position| &window[..=position])
}

/// Cut `text` to at most `max_length` characters without severing a sentence.
/// Falls back to a hard cut plus a terminal period when no sentence boundary
/// lies within the limit.
pub fn truncate_at_sentence(text: &str, max_length: usize) -> String {
    if let Some(prefix) = sentence_prefix(text, max_length) {
        return prefix.to_string();
    }

    if max_length == 0 {
        return String::new();
    }

    let mut hard: String = text.chars().take(max_length - 1).collect();
    let trimmed_len = hard.trim_end().len();
    hard.truncate(trimmed_len);
    hard.push('.');
    hard
}
