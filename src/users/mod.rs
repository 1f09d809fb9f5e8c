//! User accounts and their persistence.
//!
//! Users are kept behind the [`UserStore`] trait; [`JsonUserStore`] keeps them
//! in a single JSON file with an in-memory cache written through on every
//! mutation.

pub mod account;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub use account::{AccountService, SessionContext};

/// Account error types
#[derive(thiserror::Error, Debug)]
pub enum AccountError {
    #[error("Invalid username '{0}': use 3-20 letters, digits or underscores")]
    InvalidUsername(String),

    #[error("Password must be at least {0} characters")]
    WeakPassword(usize),

    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Not logged in")]
    NotLoggedIn,

    #[error("User store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type AccountResult<T> = std::result::Result<T, AccountError>;

/// A stored user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub username: String,
    /// `sha256$<salt>$<hex>`, or a bare 64-hex digest for accounts created
    /// before salting
    pub password_hash: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Keyed persistence for user records
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, username: &str) -> AccountResult<Option<UserRecord>>;

    /// Insert or replace
    async fn set(&self, record: UserRecord) -> AccountResult<()>;

    /// Insert only if the username is free; returns whether it was inserted
    async fn insert_new(&self, record: UserRecord) -> AccountResult<bool>;

    /// Returns whether a record was removed
    async fn delete(&self, username: &str) -> AccountResult<bool>;

    /// All usernames, sorted
    async fn list(&self) -> AccountResult<Vec<String>>;
}

/// User store backed by one JSON file
#[derive(Debug, Clone)]
pub struct JsonUserStore {
    path: PathBuf,
    users: Arc<RwLock<HashMap<String, UserRecord>>>,
}

impl JsonUserStore {
    /// Open the store at `path`, loading existing users if the file exists
    pub async fn open(path: impl AsRef<Path>) -> AccountResult<Self> {
        let path = path.as_ref().to_path_buf();

        let users = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str::<HashMap<String, UserRecord>>(&content).map_err(|e| {
                    AccountError::Store(format!("cannot parse {}: {}", path.display(), e))
                })?
            }
        } else {
            HashMap::new()
        };

        info!("👤 Loaded {} users from {}", users.len(), path.display());

        Ok(Self {
            path,
            users: Arc::new(RwLock::new(users)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the whole map, replacing the file atomically
    async fn persist(&self, users: &HashMap<String, UserRecord>) -> AccountResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(users)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &self.path).await?;

        debug!("Saved {} users to {}", users.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl UserStore for JsonUserStore {
    async fn get(&self, username: &str) -> AccountResult<Option<UserRecord>> {
        Ok(self.users.read().await.get(username).cloned())
    }

    async fn set(&self, record: UserRecord) -> AccountResult<()> {
        let mut users = self.users.write().await;
        let previous = users.insert(record.username.clone(), record.clone());

        if let Err(e) = self.persist(&users).await {
            // Keep memory and disk consistent
            match previous {
                Some(previous) => users.insert(record.username, previous),
                None => users.remove(&record.username),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn insert_new(&self, record: UserRecord) -> AccountResult<bool> {
        let mut users = self.users.write().await;
        if users.contains_key(&record.username) {
            return Ok(false);
        }

        let username = record.username.clone();
        users.insert(username.clone(), record);
        if let Err(e) = self.persist(&users).await {
            users.remove(&username);
            return Err(e);
        }
        Ok(true)
    }

    async fn delete(&self, username: &str) -> AccountResult<bool> {
        let mut users = self.users.write().await;
        let Some(removed) = users.remove(username) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&users).await {
            users.insert(username.to_string(), removed);
            return Err(e);
        }
        Ok(true)
    }

    async fn list(&self) -> AccountResult<Vec<String>> {
        let mut names: Vec<String> = self.users.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(name: &str) -> UserRecord {
        UserRecord {
            username: name.to_string(),
            password_hash: "sha256$c2FsdA==$00".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_writes_through_to_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/users.json");

        let store = JsonUserStore::open(&path).await.unwrap();
        tokio_test::assert_ok!(store.set(record("alice")).await);
        tokio_test::assert_ok!(store.set(record("bob")).await);
        assert!(store.delete("bob").await.unwrap());
        assert!(!store.delete("bob").await.unwrap());

        let reopened = JsonUserStore::open(&path).await.unwrap();
        assert_eq!(reopened.list().await.unwrap(), vec!["alice".to_string()]);
        assert_eq!(reopened.get("alice").await.unwrap(), Some(record_like(&store, "alice").await));
        assert!(reopened.get("bob").await.unwrap().is_none());
    }

    async fn record_like(store: &JsonUserStore, name: &str) -> UserRecord {
        store.get(name).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_insert_new_keeps_existing_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonUserStore::open(temp_dir.path().join("users.json")).await.unwrap();

        assert!(store.insert_new(record("alice")).await.unwrap());

        let mut replacement = record("alice");
        replacement.password_hash = "sha256$b3RoZXI=$ff".to_string();
        assert!(!store.insert_new(replacement).await.unwrap());
        assert_eq!(store.get("alice").await.unwrap().unwrap().password_hash, "sha256$c2FsdA==$00");
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonUserStore::open(temp_dir.path().join("users.json")).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("users.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonUserStore::open(&path).await.unwrap_err();
        assert!(matches!(err, AccountError::Store(_)));
    }

    #[tokio::test]
    async fn test_loads_records_without_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("users.json");
        std::fs::write(
            &path,
            r#"{"carol": {"username": "carol", "password_hash": "abc"}}"#,
        )
        .unwrap();

        let store = JsonUserStore::open(&path).await.unwrap();
        assert_eq!(store.get("carol").await.unwrap().unwrap().password_hash, "abc");
    }
}
