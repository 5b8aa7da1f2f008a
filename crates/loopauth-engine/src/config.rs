//! Login configuration.
//!
//! [`AuthConfig`] is supplied once by the caller and never mutated by the
//! engine. The IdP-specific parts (endpoint paths and how scopes are sent)
//! live in [`Endpoints`] and [`ScopePolicy`] so that one engine serves every
//! provider.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AuthError, Result};

/// Default loopback host for the redirect listener.
pub const DEFAULT_REDIRECT_HOST: &str = "127.0.0.1";

/// Default loopback port for the redirect listener.
pub const DEFAULT_REDIRECT_PORT: u16 = 21222;

/// Default safety margin before expiry at which a token is refreshed.
pub const DEFAULT_REFRESH_MARGIN_SECS: u64 = 30;

/// Default grace period for the callback listener to stop.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Default time to wait for the browser redirect (5 minutes).
pub const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 300;

/// Path of the redirect route served by the loopback listener.
pub const CALLBACK_PATH: &str = "/callback";

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Paths of the IdP endpoints, relative to the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Authorization endpoint path, e.g. `/oauth/authorize`.
    pub authorize_path: String,
    /// Token endpoint path, e.g. `/oauth/token`.
    pub token_path: String,
}

impl Endpoints {
    /// `/oauth/authorize` + `/oauth/token` (Clerk and most IdPs).
    pub fn oauth() -> Self {
        Self {
            authorize_path: "/oauth/authorize".to_string(),
            token_path: "/oauth/token".to_string(),
        }
    }

    /// `/oauth2/authorize` + `/oauth2/token` (WorkOS AuthKit).
    pub fn oauth2() -> Self {
        Self {
            authorize_path: "/oauth2/authorize".to_string(),
            token_path: "/oauth2/token".to_string(),
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::oauth()
    }
}

// ---------------------------------------------------------------------------
// Scope policy
// ---------------------------------------------------------------------------

/// How the `scope` parameter of the authorize request is produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopePolicy {
    /// Send the configured scopes.
    #[default]
    Configured,
    /// Always send this provider-mandated scope set.
    Fixed(Vec<String>),
}

// ---------------------------------------------------------------------------
// AuthConfig
// ---------------------------------------------------------------------------

/// Caller-supplied configuration for one identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Base URI of the identity provider, e.g. `https://acme.clerk.accounts.dev`.
    pub issuer: String,

    /// The OAuth client ID (public client, no secret).
    pub client_id: String,

    /// Loopback host the redirect listener binds to.
    #[serde(default = "default_redirect_host")]
    pub redirect_host: String,

    /// Loopback port the redirect listener binds to.
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,

    /// Requested scopes, in order.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// IdP endpoint paths.
    #[serde(default)]
    pub endpoints: Endpoints,

    /// How the authorize request's `scope` is built.
    #[serde(default)]
    pub scope_policy: ScopePolicy,

    /// Refresh tokens this many seconds before they expire.
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,

    /// How long the listener may take to stop before it is aborted.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// How long `login` waits for the browser redirect.
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
}

fn default_redirect_host() -> String {
    DEFAULT_REDIRECT_HOST.to_string()
}

fn default_redirect_port() -> u16 {
    DEFAULT_REDIRECT_PORT
}

fn default_refresh_margin_secs() -> u64 {
    DEFAULT_REFRESH_MARGIN_SECS
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

fn default_login_timeout_secs() -> u64 {
    DEFAULT_LOGIN_TIMEOUT_SECS
}

impl AuthConfig {
    /// Create a configuration with default loopback settings.
    pub fn new(issuer: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            redirect_host: default_redirect_host(),
            redirect_port: DEFAULT_REDIRECT_PORT,
            scopes: Vec::new(),
            endpoints: Endpoints::default(),
            scope_policy: ScopePolicy::default(),
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            login_timeout_secs: DEFAULT_LOGIN_TIMEOUT_SECS,
        }
    }

    /// Clerk preset: `/oauth/*` endpoints and the scope set Clerk requires
    /// for refresh tokens, independent of [`AuthConfig::scopes`].
    pub fn clerk(account_uri: impl Into<String>, client_id: impl Into<String>) -> Self {
        let mut config = Self::new(account_uri, client_id);
        config.endpoints = Endpoints::oauth();
        config.scope_policy = ScopePolicy::Fixed(vec![
            "email".to_string(),
            "offline_access".to_string(),
            "profile".to_string(),
        ]);
        config
    }

    /// WorkOS AuthKit preset: `/oauth2/*` endpoints and configured scopes.
    pub fn workos(authkit_uri: impl Into<String>, client_id: impl Into<String>) -> Self {
        let mut config = Self::new(authkit_uri, client_id);
        config.endpoints = Endpoints::oauth2();
        config.scope_policy = ScopePolicy::Configured;
        config
    }

    /// Set the loopback host and port.
    pub fn with_redirect(mut self, host: impl Into<String>, port: u16) -> Self {
        self.redirect_host = host.into();
        self.redirect_port = port;
        self
    }

    /// Set the requested scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// `http://{host}:{port}/callback`
    pub fn redirect_uri(&self) -> String {
        format!("http://{}{CALLBACK_PATH}", self.listen_addr())
    }

    /// `{host}:{port}`, with IPv6 hosts bracketed.
    pub fn listen_addr(&self) -> String {
        if self.redirect_host.contains(':') && !self.redirect_host.starts_with('[') {
            format!("[{}]:{}", self.redirect_host, self.redirect_port)
        } else {
            format!("{}:{}", self.redirect_host, self.redirect_port)
        }
    }

    /// Full authorization endpoint URL.
    pub fn authorize_url(&self) -> String {
        join_issuer(&self.issuer, &self.endpoints.authorize_path)
    }

    /// Full token endpoint URL.
    pub fn token_url(&self) -> String {
        join_issuer(&self.issuer, &self.endpoints.token_path)
    }

    /// The space-joined `scope` value for the authorize request, if any.
    pub fn scope_param(&self) -> Option<String> {
        let scopes = match &self.scope_policy {
            ScopePolicy::Configured => &self.scopes,
            ScopePolicy::Fixed(fixed) => fixed,
        };
        if scopes.is_empty() {
            None
        } else {
            Some(scopes.join(" "))
        }
    }

    /// Safety margin applied before expiry.
    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    /// Grace period for listener shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// How long to wait for the redirect.
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    /// Check the configuration before starting a login.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] if the issuer is not an http(s)
    /// URL, the client ID is empty, or the redirect host is not loopback.
    pub fn validate(&self) -> Result<()> {
        let issuer = Url::parse(&self.issuer).map_err(|e| AuthError::InvalidConfig {
            reason: format!("issuer '{}' is not a valid URL: {e}", self.issuer),
        })?;
        if !matches!(issuer.scheme(), "http" | "https") {
            return Err(AuthError::InvalidConfig {
                reason: format!("issuer scheme must be http or https, got '{}'", issuer.scheme()),
            });
        }

        if self.client_id.trim().is_empty() {
            return Err(AuthError::InvalidConfig {
                reason: "client_id is empty".to_string(),
            });
        }

        let host = self.redirect_host.trim_start_matches('[').trim_end_matches(']');
        let loopback = host == "localhost"
            || host
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false);
        if !loopback {
            return Err(AuthError::InvalidConfig {
                reason: format!(
                    "redirect_host '{}' is not a loopback address",
                    self.redirect_host
                ),
            });
        }

        Ok(())
    }
}

fn join_issuer(issuer: &str, path: &str) -> String {
    format!("{}{}", issuer.trim_end_matches('/'), path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
