//! Loopback OAuth login engine.
//!
//! This crate signs a user in to a third-party identity provider from a CLI
//! or native app, then keeps an authenticated HTTP client working across
//! token expiry:
//!
//! - **OAuth 2.0 Authorization Code Flow** with PKCE (RFC 7636, `S256`)
//! - **Loopback callback listener** that receives the browser redirect
//! - **Refresh guard**: single-flight token refresh over caller-owned storage
//! - **Authenticated transport**: bearer header plus one refresh-and-retry on 401
//!
//! Token persistence and browser launching are capabilities supplied by the
//! caller ([`TokenStore`], [`BrowserOpener`]).
//!
//! # Architecture
//!
//! ```text
//! AuthManager
//! ├── oauth               (PKCE, state, authorize URL, token endpoint)
//! ├── CallbackListener    (ephemeral axum server on /callback)
//! ├── TokenCache          (load → check → refresh → save, under one lock)
//! └── AuthenticatedClient (bearer header, 401 → forced refresh → retry once)
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use loopauth_engine::{AuthConfig, AuthManager, MemoryTokenStore};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> loopauth_engine::Result<()> {
//! let config = AuthConfig::workos("https://auth.example.com", "client_123")
//!     .with_redirect("127.0.0.1", 21222)
//!     .with_scopes(["openid", "profile", "offline_access"]);
//!
//! let manager = AuthManager::new(
//!     config,
//!     |url: &str| println!("open {url}"),
//!     Arc::new(MemoryTokenStore::new()),
//! );
//!
//! manager.login(&CancellationToken::new()).await?;
//!
//! let response = manager
//!     .http_client()
//!     .get("https://api.example.com/v1/stores")
//!     .await?;
//! println!("status: {}", response.status());
//! # Ok(())
//! # }
//! ```

pub mod browser;
pub mod cache;
pub mod callback;
pub mod config;
pub mod error;
pub mod manager;
pub mod oauth;
pub mod token;
pub mod transport;

// Re-export key types at the crate root for convenience.
pub use browser::{BrowserOpener, LogOnly};
pub use cache::TokenCache;
pub use callback::CallbackListener;
pub use config::{AuthConfig, Endpoints, ScopePolicy};
pub use error::{AuthError, Result, StoreError};
pub use manager::AuthManager;
pub use oauth::{OAuthFlow, PkcePair, authorization_url, create_pkce_pair, create_state};
pub use token::{MemoryTokenStore, Token, TokenStore};
pub use transport::AuthenticatedClient;
