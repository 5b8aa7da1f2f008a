//! Tokens and the persistence capability.
//!
//! The engine never keeps a [`Token`] between calls. Every read goes through
//! [`TokenStore::load`] and every new token through [`TokenStore::save`], so
//! the caller owns where and how tokens live.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;

/// An access/refresh token pair as handed to the [`TokenStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Bearer token attached to API requests.
    pub access_token: String,

    /// Token used to obtain a new access token. Empty means absent.
    #[serde(default)]
    pub refresh_token: String,

    /// When the access token expires. `None` means unknown, which is
    /// treated as already expired.
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl Token {
    /// The refresh token, if one was issued.
    pub fn refresh_token(&self) -> Option<&str> {
        if self.refresh_token.is_empty() {
            None
        } else {
            Some(&self.refresh_token)
        }
    }

    /// Whether the access token is still usable for at least `margin`.
    pub fn is_fresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let Some(expiry) = self.expiry else {
            return false;
        };
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(margin) {
            Some(deadline) => expiry > deadline,
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// TokenStore
// ---------------------------------------------------------------------------

/// Caller-supplied token persistence.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Load the current token.
    async fn load(&self) -> Result<Token, StoreError>;

    /// Replace the current token.
    async fn save(&self, token: &Token) -> Result<(), StoreError>;
}

/// An in-process [`TokenStore`] that keeps the token in memory.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<Token>>,
}

impl MemoryTokenStore {
    /// An empty store; `load` fails until a token is saved.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `token`.
    pub fn with_token(token: Token) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }

    /// The stored token, if any, without going through `load`.
    pub async fn current(&self) -> Option<Token> {
        self.token.lock().await.clone()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<Token, StoreError> {
        self.token
            .lock()
            .await
            .clone()
            .ok_or_else(|| "no token stored".into())
    }

    async fn save(&self, token: &Token) -> Result<(), StoreError> {
        *self.token.lock().await = Some(token.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
