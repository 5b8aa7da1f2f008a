//! Error types for the loopauth engine.
//!
//! Every engine operation surfaces errors through [`AuthError`], the single
//! error type for this crate. Each variant carries enough context for callers
//! to decide whether to retry, surface the problem, or restart the login.

use std::time::Duration;

/// Error type returned by a caller-supplied [`TokenStore`](crate::TokenStore).
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for the loopauth engine.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The system CSPRNG could not supply random bytes.
    #[error("system random source failed while generating {purpose}")]
    RandomSource {
        /// What the random bytes were for.
        purpose: &'static str,
    },

    /// Configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// URL parsing error.
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// The `state` on the redirect did not match the one sent to the IdP.
    #[error("state mismatch on OAuth callback")]
    StateMismatch,

    /// The redirect carried the right state but no authorization code.
    #[error("OAuth callback is missing the authorization code")]
    MissingCode,

    /// The caller cancelled the login while it was waiting for the redirect.
    #[error("login cancelled")]
    Cancelled,

    /// No redirect arrived before the login deadline.
    #[error("no OAuth callback received within {}s", .timeout.as_secs())]
    DeadlineExceeded {
        /// How long we waited before giving up.
        timeout: Duration,
    },

    /// The loopback listener could not bind or stopped serving.
    #[error("callback listener error: {0}")]
    Listener(#[source] std::io::Error),

    /// The listener stopped without delivering a code or an error.
    #[error("callback listener closed before a result was delivered")]
    ListenerClosed,

    /// The authorization code exchange was rejected or could not be sent.
    #[error("code exchange failed ({}): {body}", status_label(.status))]
    ExchangeFailed {
        /// HTTP status from the token endpoint, absent on transport failure.
        status: Option<u16>,
        /// Response body, or the transport error message.
        body: String,
    },

    /// The caller-supplied store failed to load the token.
    #[error("failed to load token: {0}")]
    LoadFailed(#[source] StoreError),

    /// The caller-supplied store failed to save the token.
    #[error("failed to save token: {0}")]
    SaveFailed(#[source] StoreError),

    /// The token needs a refresh but carries no refresh token.
    #[error("no refresh token available; login required")]
    NoRefreshToken,

    /// The refresh-token grant was rejected or could not be sent.
    #[error("token refresh failed ({}): {body}", status_label(.status))]
    RefreshFailed {
        /// HTTP status from the token endpoint, absent on transport failure.
        status: Option<u16>,
        /// Response body, or the transport error message.
        body: String,
    },

    /// The access token cannot be sent in an `Authorization` header.
    #[error("access token contains characters not allowed in an HTTP header")]
    InvalidAccessToken,

    /// The outgoing request has a streaming body and cannot be replayed.
    #[error("request body cannot be cloned for authenticated retry")]
    RequestNotCloneable,

    /// An HTTP request through the underlying transport failed.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl AuthError {
    /// Whether this error means the interactive login has to run again.
    pub fn requires_login(&self) -> bool {
        match self {
            Self::NoRefreshToken | Self::ExchangeFailed { .. } => true,
            Self::RefreshFailed {
                status: Some(400 | 401),
                ..
            } => true,
            _ => false,
        }
    }
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {code}"),
        None => "transport".to_string(),
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
