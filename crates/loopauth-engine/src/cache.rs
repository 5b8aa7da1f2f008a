//! Refresh-guarded access to the caller's token.
//!
//! [`TokenCache`] is the only shared mutable resource in the engine. All
//! calls to [`TokenCache::get_valid_token`] are serialized by one async
//! mutex, so concurrent callers holding an expired token trigger a single
//! refresh and then observe the refreshed token.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{AuthError, Result};
use crate::oauth::OAuthFlow;
use crate::token::{Token, TokenStore};

/// Loads, validates and refreshes the token of one identity.
pub struct TokenCache {
    flow: OAuthFlow,
    store: Arc<dyn TokenStore>,
    margin: Duration,
    refresh_lock: Mutex<()>,
}

impl TokenCache {
    /// Create a cache that refreshes through `flow` and persists via `store`.
    pub fn new(flow: OAuthFlow, store: Arc<dyn TokenStore>) -> Self {
        let margin = flow.config().refresh_margin();
        Self {
            flow,
            store,
            margin,
            refresh_lock: Mutex::new(()),
        }
    }

    /// The token endpoint client.
    pub fn flow(&self) -> &OAuthFlow {
        &self.flow
    }

    /// Persist a token obtained outside the refresh path (e.g. a login).
    ///
    /// Takes the refresh lock so it never interleaves with a refresh.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SaveFailed`] if the store rejects the token.
    pub async fn store(&self, token: &Token) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.store.save(token).await.map_err(AuthError::SaveFailed)
    }

    /// Return a token that is valid for at least the refresh margin.
    ///
    /// With `force_refresh` the stored token is refreshed even if it still
    /// looks valid (used after the API answered 401).
    ///
    /// # Errors
    ///
    /// - [`AuthError::LoadFailed`] / [`AuthError::SaveFailed`] from the store.
    /// - [`AuthError::NoRefreshToken`] if a refresh is needed but impossible.
    /// - [`AuthError::RefreshFailed`] if the token endpoint rejects the grant.
    pub async fn get_valid_token(&self, force_refresh: bool) -> Result<Token> {
        let _guard = self.refresh_lock.lock().await;

        let token = self.store.load().await.map_err(AuthError::LoadFailed)?;

        if !force_refresh && token.is_fresh(self.margin, Utc::now()) {
            return Ok(token);
        }

        let Some(refresh_token) = token.refresh_token() else {
            tracing::debug!("token needs refresh but has no refresh token");
            return Err(AuthError::NoRefreshToken);
        };

        tracing::debug!(force_refresh, "refreshing access token");
        let refreshed = self.flow.refresh_token(refresh_token).await?;

        self.store
            .save(&refreshed)
            .await
            .map_err(AuthError::SaveFailed)?;

        tracing::info!(expiry = ?refreshed.expiry, "access token refreshed");
        Ok(refreshed)
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("token_url", &self.flow.config().token_url())
            .field("margin", &self.margin)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
