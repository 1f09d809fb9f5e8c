use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

use super::{AccountError, AccountResult, UserRecord, UserStore};

pub const MIN_PASSWORD_LEN: usize = 8;

const HASH_SCHEME: &str = "sha256";

pub fn validate_username(username: &str) -> AccountResult<()> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let valid = PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9_]{3,20}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(username));

    if valid {
        Ok(())
    } else {
        Err(AccountError::InvalidUsername(username.to_string()))
    }
}

pub fn validate_password(password: &str) -> AccountResult<()> {
    if password.chars().count() >= MIN_PASSWORD_LEN {
        Ok(())
    } else {
        Err(AccountError::WeakPassword(MIN_PASSWORD_LEN))
    }
}

fn sha256_hex(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Salted hash in the form `sha256$<salt_b64>$<hex>`
pub fn hash_password(password: &str) -> String {
    let salt: [u8; 16] = rand::rng().random();
    let encoded = base64::engine::general_purpose::STANDARD.encode(salt);
    format!("{}${}${}", HASH_SCHEME, encoded, sha256_hex(&salt, password))
}

/// Check a password against a stored hash (salted, or a legacy unsalted digest)
pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    match parts.as_slice() {
        [HASH_SCHEME, salt, digest] => match base64::engine::general_purpose::STANDARD.decode(salt) {
            Ok(salt) => constant_time_eq(sha256_hex(&salt, password).as_bytes(), digest.as_bytes()),
            Err(_) => false,
        },
        [legacy] if legacy.len() == 64 => {
            constant_time_eq(sha256_hex(&[], password).as_bytes(), legacy.to_ascii_lowercase().as_bytes())
        }
        _ => false,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Who is logged in for the current invocation
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    user: Option<String>,
    logged_in_at: Option<DateTime<Utc>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn logged_in_at(&self) -> Option<DateTime<Utc>> {
        self.logged_in_at
    }

    pub fn is_logged_in(&self) -> bool {
        self.user.is_some()
    }

    /// Gate for commands that need a logged-in user when login is required
    pub fn ensure_access(&self, require_login: bool) -> AccountResult<()> {
        if require_login && !self.is_logged_in() {
            return Err(AccountError::NotLoggedIn);
        }
        Ok(())
    }

    fn require_user(&self) -> AccountResult<String> {
        self.user.clone().ok_or(AccountError::NotLoggedIn)
    }

    fn set(&mut self, username: String) {
        self.user = Some(username);
        self.logged_in_at = Some(Utc::now());
    }

    fn clear(&mut self) {
        self.user = None;
        self.logged_in_at = None;
    }
}

/// Registration, login and account maintenance on top of a [`UserStore`]
pub struct AccountService {
    store: Arc<dyn UserStore>,
}

impl AccountService {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    pub async fn register(&self, username: &str, password: &str) -> AccountResult<()> {
        validate_username(username)?;
        validate_password(password)?;

        let inserted = self
            .store
            .insert_new(UserRecord {
                username: username.to_string(),
                password_hash: hash_password(password),
                created_at: Utc::now(),
            })
            .await?;
        if !inserted {
            return Err(AccountError::UserExists(username.to_string()));
        }

        info!("👤 Registered user {}", username);
        Ok(())
    }

    pub async fn login(&self, session: &mut SessionContext, username: &str, password: &str) -> AccountResult<()> {
        let record = self.store.get(username).await?;

        match record {
            Some(record) if verify_password(password, &record.password_hash) => {
                session.set(record.username);
                info!("🔓 {} logged in", username);
                Ok(())
            }
            _ => {
                warn!("Failed login for {}", username);
                Err(AccountError::InvalidCredentials)
            }
        }
    }

    pub fn logout(&self, session: &mut SessionContext) {
        if let Some(user) = session.current_user() {
            info!("🔒 {} logged out", user);
        }
        session.clear();
    }

    /// Replace the logged-in user's password; the old one must match
    pub async fn change_password(
        &self,
        session: &SessionContext,
        old_password: &str,
        new_password: &str,
    ) -> AccountResult<()> {
        let username = session.require_user()?;
        let mut record = self
            .store
            .get(&username)
            .await?
            .ok_or_else(|| AccountError::UserNotFound(username.clone()))?;

        if !verify_password(old_password, &record.password_hash) {
            return Err(AccountError::InvalidCredentials);
        }
        validate_password(new_password)?;

        record.password_hash = hash_password(new_password);
        self.store.set(record).await?;

        info!("🔑 Password changed for {}", username);
        Ok(())
    }

    /// Delete the logged-in user and end the session
    pub async fn delete_account(&self, session: &mut SessionContext) -> AccountResult<()> {
        let username = session.require_user()?;

        if !self.store.delete(&username).await? {
            return Err(AccountError::UserNotFound(username));
        }

        session.clear();
        info!("🗑️ Deleted user {}", username);
        Ok(())
    }

    pub async fn list_users(&self) -> AccountResult<Vec<String>> {
        self.store.list().await
    }
}
