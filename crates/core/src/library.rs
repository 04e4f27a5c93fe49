//! Per-user flat files: processed books, conversation turns and accounts.

use crate::error::{IngestError, Result};
use crate::models::{BookRecord, ConversationTurn};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(error) => Err(error.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

pub fn user_file(data_dir: &Path, prefix: &str, username: &str) -> PathBuf {
    data_dir.join(format!("{prefix}_{username}.json"))
}

/// Content hash to display name for every book a user has ingested.
#[derive(Debug)]
pub struct BookRegistry {
    path: PathBuf,
    books: BTreeMap<String, BookRecord>,
}

impl BookRegistry {
    pub fn open(data_dir: &Path, username: &str) -> Result<Self> {
        let path = user_file(data_dir, "processed_books", username);
        let books = read_json(&path)?;
        Ok(Self { path, books })
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.books.contains_key(hash)
    }

    pub fn insert(&mut self, hash: &str, name: &str) -> Result<()> {
        self.books.insert(
            hash.to_string(),
            BookRecord {
                name: name.to_string(),
                ingested_at: Utc::now(),
            },
        );
        write_json(&self.path, &self.books)
    }

    fn key_for(&self, hash_or_name: &str) -> Option<String> {
        self.books
            .iter()
            .find(|(hash, record)| hash.as_str() == hash_or_name || record.name == hash_or_name)
            .map(|(hash, _)| hash.clone())
    }

    /// Look up by hash or display name.
    pub fn get(&self, hash_or_name: &str) -> Option<&BookRecord> {
        self.key_for(hash_or_name).and_then(|key| self.books.get(&key))
    }

    /// Remove by hash or display name; returns the removed record.
    pub fn remove(&mut self, hash_or_name: &str) -> Result<Option<BookRecord>> {
        let Some(key) = self.key_for(hash_or_name) else {
            return Ok(None);
        };
        let removed = self.books.remove(&key);
        write_json(&self.path, &self.books)?;
        Ok(removed)
    }

    pub fn names(&self) -> Vec<String> {
        self.books.values().map(|record| record.name.clone()).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &BookRecord)> {
        self.books.iter()
    }
}

/// Ordered, append-only turns of one user's conversation.
#[derive(Debug)]
pub struct ConversationLog {
    path: PathBuf,
    turns: Vec<ConversationTurn>,
}

impl ConversationLog {
    pub fn open(data_dir: &Path, username: &str) -> Result<Self> {
        let path = user_file(data_dir, "conversation_history", username);
        let turns = read_json(&path)?;
        Ok(Self { path, turns })
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn append(&mut self, turn: ConversationTurn) -> Result<()> {
        self.turns.push(turn);
        write_json(&self.path, &self.turns)
    }
}

/// Username to password map in `users.json`.
///
/// Passwords are stored and compared in plaintext. This is a known gap kept
/// for compatibility with existing account files.
#[derive(Debug)]
pub struct AccountFile {
    path: PathBuf,
}

impl AccountFile {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("users.json"),
        }
    }

    pub fn login(&self, username: &str, password: &str) -> Result<bool> {
        let users: BTreeMap<String, String> = read_json(&self.path)?;
        Ok(users.get(username).is_some_and(|stored| stored == password))
    }

    /// `false` when the username is taken.
    pub fn register(&self, username: &str, password: &str) -> Result<bool> {
        if username.trim().is_empty() {
            return Err(IngestError::InvalidArgument("username is empty".to_string()));
        }
        let mut users: BTreeMap<String, String> = read_json(&self.path)?;
        if users.contains_key(username) {
            return Ok(false);
        }
        users.insert(username.to_string(), password.to_string());
        write_json(&self.path, &users)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn registry_round_trips_through_disk() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut registry = BookRegistry::open(dir.path(), "ana")?;
        registry.insert("abc123", "pumps.pdf")?;

        let reopened = BookRegistry::open(dir.path(), "ana")?;
        assert!(reopened.contains("abc123"));
        assert_eq!(reopened.names(), vec!["pumps.pdf".to_string()]);
        assert!(!BookRegistry::open(dir.path(), "bob")?.contains("abc123"));
        Ok(())
    }

    #[test]
    fn registry_removes_by_name() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut registry = BookRegistry::open(dir.path(), "ana")?;
        registry.insert("abc123", "pumps.pdf")?;

        assert_eq!(
            registry.get("abc123").map(|record| record.name.as_str()),
            Some("pumps.pdf")
        );
        let removed = registry.remove("pumps.pdf")?;
        assert_eq!(removed.map(|record| record.name), Some("pumps.pdf".to_string()));
        assert!(registry.remove("pumps.pdf")?.is_none());
        assert!(BookRegistry::open(dir.path(), "ana")?.names().is_empty());
        Ok(())
    }

    #[test]
    fn conversation_log_appends_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut log = ConversationLog::open(dir.path(), "ana")?;
        log.append(ConversationTurn::user("Hi?"))?;
        log.append(ConversationTurn::assistant("Hello."))?;

        let reopened = ConversationLog::open(dir.path(), "ana")?;
        assert_eq!(
            reopened.turns(),
            &[ConversationTurn::user("Hi?"), ConversationTurn::assistant("Hello.")]
        );
        Ok(())
    }

    #[test]
    fn accounts_register_once_and_login() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let accounts = AccountFile::new(dir.path());

        assert!(!accounts.login("ana", "pw")?);
        assert!(accounts.register("ana", "pw")?);
        assert!(!accounts.register("ana", "other")?);
        assert!(accounts.login("ana", "pw")?);
        assert!(!accounts.login("ana", "wrong")?);
        Ok(())
    }
}
