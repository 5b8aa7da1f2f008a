//! High-level login and token manager.
//!
//! The [`AuthManager`] runs the interactive browser login end-to-end and
//! hands out [`AuthenticatedClient`]s that share its refresh guard. It is
//! the primary entry point for applications; one manager per identity.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::browser::BrowserOpener;
use crate::cache::TokenCache;
use crate::callback::CallbackListener;
use crate::config::AuthConfig;
use crate::error::Result;
use crate::oauth::{OAuthFlow, authorization_url, create_pkce_pair, create_state};
use crate::token::{Token, TokenStore};
use crate::transport::AuthenticatedClient;

/// Orchestrates the login flow and token access for one identity.
pub struct AuthManager {
    config: AuthConfig,
    browser: Arc<dyn BrowserOpener>,
    cache: Arc<TokenCache>,
    http: reqwest::Client,
}

impl AuthManager {
    /// Create a manager with a default HTTP client.
    pub fn new(
        config: AuthConfig,
        browser: impl BrowserOpener + 'static,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        Self::with_http_client(config, browser, store, reqwest::Client::new())
    }

    /// Create a manager whose token requests and authenticated requests go
    /// through `http`.
    pub fn with_http_client(
        config: AuthConfig,
        browser: impl BrowserOpener + 'static,
        store: Arc<dyn TokenStore>,
        http: reqwest::Client,
    ) -> Self {
        let flow = OAuthFlow::with_client(config.clone(), http.clone());
        Self {
            config,
            browser: Arc::new(browser),
            cache: Arc::new(TokenCache::new(flow, store)),
            http,
        }
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Run the interactive browser login.
    ///
    /// 1. Generate the PKCE pair and `state`.
    /// 2. Build the authorization URL.
    /// 3. Start the loopback listener.
    /// 4. Open the browser.
    /// 5. Wait for the redirect (bounded by the login timeout and `cancel`).
    /// 6. Stop the listener.
    /// 7. Exchange the code for tokens and save them.
    ///
    /// The listener is stopped on every exit path, and nothing is saved
    /// unless the exchange succeeds.
    ///
    /// # Errors
    ///
    /// Any step's error aborts the login; see [`crate::AuthError`].
    pub async fn login(&self, cancel: &CancellationToken) -> Result<Token> {
        self.config.validate()?;

        let pkce = create_pkce_pair()?;
        let state = create_state()?;
        let auth_url = authorization_url(&self.config, &pkce.challenge, &state)?;
        tracing::debug!(url = %auth_url, "login: authorization URL built");

        let mut listener = CallbackListener::start(&self.config, state).await?;

        tracing::info!(
            addr = %listener.local_addr(),
            "login: opening browser, waiting for redirect"
        );
        self.browser.open(&auth_url);

        let code = listener
            .wait_for_code(cancel, self.config.login_timeout())
            .await;
        listener.shutdown().await;
        let code = code.inspect_err(|e| {
            tracing::warn!(error = %e, "login: no authorization code received");
        })?;

        tracing::debug!("login: exchanging code for tokens");
        let token = self
            .cache
            .flow()
            .exchange_code(&code, &pkce.verifier)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "login: code exchange failed"))?;

        self.cache.store(&token).await?;

        tracing::info!(expiry = ?token.expiry, "login completed");
        Ok(token)
    }

    /// Return a valid token, refreshing it if needed.
    ///
    /// # Errors
    ///
    /// See [`TokenCache::get_valid_token`].
    pub async fn get_valid_token(&self, force_refresh: bool) -> Result<Token> {
        self.cache.get_valid_token(force_refresh).await
    }

    /// An HTTP client that authenticates with this manager's token.
    pub fn http_client(&self) -> AuthenticatedClient {
        AuthenticatedClient::new(Arc::clone(&self.cache), self.http.clone())
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("issuer", &self.config.issuer)
            .field("client_id", &self.config.client_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
