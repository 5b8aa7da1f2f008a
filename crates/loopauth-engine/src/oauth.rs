//! OAuth 2.0 Authorization Code Flow with PKCE.
//!
//! This module implements the protocol pieces of the authorization code flow
//! (RFC 6749) with Proof Key for Code Exchange (RFC 7636, `S256` only):
//!
//! 1. Generate a PKCE verifier/challenge pair and a `state` token.
//! 2. Build the authorization URL the user's browser is sent to.
//! 3. Exchange the authorization code + verifier for tokens.
//! 4. Refresh tokens with the refresh-token grant.
//!
//! The loopback redirect itself lives in [`crate::callback`].

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use url::Url;

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::token::Token;

/// Length of the PKCE code verifier in bytes (before base64 encoding).
const PKCE_VERIFIER_BYTES: usize = 64;

/// Length of the `state` token in bytes (before base64 encoding).
const STATE_BYTES: usize = 24;

// ---------------------------------------------------------------------------
// PKCE helpers
// ---------------------------------------------------------------------------

/// A PKCE verifier and its `S256` challenge.
#[derive(Clone)]
pub struct PkcePair {
    /// Sent only in the token exchange request body.
    pub verifier: String,
    /// Sent in the authorization URL.
    pub challenge: String,
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Generate a PKCE pair from 64 bytes of CSPRNG output.
///
/// # Errors
///
/// Returns [`AuthError::RandomSource`] if the system CSPRNG fails.
pub fn create_pkce_pair() -> Result<PkcePair> {
    let verifier = random_urlsafe::<PKCE_VERIFIER_BYTES>("PKCE verifier")?;
    let challenge = pkce_challenge(&verifier);
    Ok(PkcePair {
        verifier,
        challenge,
    })
}

/// Derive the PKCE code challenge from a code verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn pkce_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Generate a fresh anti-CSRF `state` token.
///
/// # Errors
///
/// Returns [`AuthError::RandomSource`] if the system CSPRNG fails.
pub fn create_state() -> Result<String> {
    random_urlsafe::<STATE_BYTES>("state token")
}

fn random_urlsafe<const N: usize>(purpose: &'static str) -> Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; N];
    rng.fill(&mut bytes)
        .map_err(|_| AuthError::RandomSource { purpose })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

// ---------------------------------------------------------------------------
// Authorize URL
// ---------------------------------------------------------------------------

/// Build the authorization URL the user's browser should visit.
///
/// # Errors
///
/// Returns [`AuthError::UrlParse`] if the issuer in `config` does not form a
/// valid URL.
pub fn authorization_url(config: &AuthConfig, challenge: &str, state: &str) -> Result<String> {
    let mut url = Url::parse(&config.authorize_url())?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("response_type", "code");
        params.append_pair("code_challenge_method", "S256");
        params.append_pair("client_id", &config.client_id);
        params.append_pair("redirect_uri", &config.redirect_uri());
        if let Some(scope) = config.scope_param() {
            params.append_pair("scope", &scope);
        }
        params.append_pair("state", state);
        params.append_pair("code_challenge", challenge);
    }

    Ok(url.to_string())
}

// ---------------------------------------------------------------------------
// Token endpoint
// ---------------------------------------------------------------------------

/// Raw token response from the authorization server.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<ExpiresIn>,
}

/// `expires_in` as sent on the wire. Some servers quote the number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(i64),
    Quoted(String),
}

impl ExpiresIn {
    fn seconds(&self) -> Option<i64> {
        match self {
            Self::Seconds(secs) => Some(*secs),
            Self::Quoted(text) => text.trim().parse().ok(),
        }
    }
}

impl TokenResponse {
    /// Convert into a [`Token`], computing the expiry from `expires_in`.
    ///
    /// A refresh response without a refresh token keeps `previous_refresh`.
    /// Fails with a description if `expires_in` is unreadable or does not
    /// fit a timestamp.
    fn into_token(self, previous_refresh: Option<&str>) -> std::result::Result<Token, String> {
        let expiry = match self.expires_in {
            None => None,
            Some(expires_in) => {
                let secs = expires_in
                    .seconds()
                    .ok_or_else(|| format!("expires_in is not a number: {expires_in:?}"))?;
                if secs > 0 {
                    let expiry = chrono::TimeDelta::try_seconds(secs)
                        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                        .ok_or_else(|| format!("expires_in out of range: {secs}"))?;
                    Some(expiry)
                } else {
                    None
                }
            }
        };

        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(str::to_string))
            .unwrap_or_default();

        Ok(Token {
            access_token: self.access_token,
            refresh_token,
            expiry,
        })
    }
}

/// Which grant a token request carries; picks the error variant.
#[derive(Debug, Clone, Copy)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

impl Grant {
    fn failure(self, status: Option<u16>, body: String) -> AuthError {
        match self {
            Self::AuthorizationCode => AuthError::ExchangeFailed { status, body },
            Self::RefreshToken => AuthError::RefreshFailed { status, body },
        }
    }
}

/// Client for the IdP token endpoint.
///
/// Stateless apart from the configuration and the pooled HTTP client.
#[derive(Debug, Clone)]
pub struct OAuthFlow {
    config: AuthConfig,
    client: reqwest::Client,
}

impl OAuthFlow {
    /// Create a flow with its own HTTP client.
    pub fn new(config: AuthConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    /// Create a flow that sends token requests through `client`.
    pub fn with_client(config: AuthConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    /// The configuration this flow was built with.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Exchange an authorization code for tokens.
    ///
    /// `code_verifier` must be the verifier whose challenge was sent in the
    /// authorization URL. Scopes are not sent; they were fixed at the
    /// authorize step.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ExchangeFailed`] on a non-2xx response or a
    /// transport failure.
    pub async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<Token> {
        let redirect_uri = self.config.redirect_uri();
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];

        tracing::debug!(token_url = %self.config.token_url(), "exchanging authorization code");

        self.post_token(Grant::AuthorizationCode, &params, None)
            .await
    }

    /// Obtain a new token with the refresh-token grant.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RefreshFailed`] on a non-2xx response or a
    /// transport failure.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Token> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];

        tracing::debug!(token_url = %self.config.token_url(), "refreshing access token");

        self.post_token(Grant::RefreshToken, &params, Some(refresh_token))
            .await
    }

    async fn post_token(
        &self,
        grant: Grant,
        params: &[(&str, &str)],
        previous_refresh: Option<&str>,
    ) -> Result<Token> {
        let response = self
            .client
            .post(self.config.token_url())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(params)
            .send()
            .await
            .map_err(|e| grant.failure(None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), ?grant, "token endpoint rejected request");
            return Err(grant.failure(Some(status.as_u16()), body));
        }

        let body = response
            .text()
            .await
            .map_err(|e| grant.failure(Some(status.as_u16()), e.to_string()))?;
        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            grant.failure(
                Some(status.as_u16()),
                format!("malformed token response: {e}"),
            )
        })?;

        let token = parsed.into_token(previous_refresh).map_err(|reason| {
            grant.failure(
                Some(status.as_u16()),
                format!("malformed token response: {reason}"),
            )
        })?;

        tracing::debug!(?grant, "token endpoint request successful");
        Ok(token)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> AuthConfig {
        AuthConfig::workos("https://auth.example.com", "test-client-id")
            .with_redirect("127.0.0.1", 8400)
            .with_scopes(["read", "write"])
    }

    #[test]
    fn pkce_verifier_is_correct_length() {
        let pair = create_pkce_pair().unwrap();
        // 64 bytes base64url encoded = 86 characters (no padding).
        assert_eq!(pair.verifier.len(), 86);
    }

    #[test]
    fn pkce_verifier_is_url_safe() {
        let pair = create_pkce_pair().unwrap();
        for c in pair.verifier.chars() {
            assert!(
                c.is_ascii_alphanumeric() || c == '-' || c == '_',
                "unexpected character in verifier: {c}"
            );
        }
    }

    #[test]
    fn pkce_pair_challenge_matches_verifier() {
        let pair = create_pkce_pair().unwrap();
        assert_eq!(pair.challenge, pkce_challenge(&pair.verifier));
    }

    #[test]
    fn pkce_challenge_is_base64url_sha256() {
        // RFC 7636 Appendix B test vector.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = pkce_challenge(verifier);
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn pkce_pairs_do_not_repeat() {
        let pairs: Vec<_> = (0..64).map(|_| create_pkce_pair().unwrap()).collect();
        let unique: std::collections::HashSet<_> =
            pairs.iter().map(|p| p.verifier.as_str()).collect();
        assert_eq!(unique.len(), pairs.len());
    }

    #[test]
    fn pkce_pair_debug_redacts_verifier() {
        let pair = create_pkce_pair().unwrap();
        let debug = format!("{pair:?}");
        assert!(!debug.contains(&pair.verifier));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn state_is_32_urlsafe_chars() {
        let state = create_state().unwrap();
        // 24 bytes encode to exactly 32 characters.
        assert_eq!(state.len(), 32);
        assert_ne!(state, create_state().unwrap());
    }

    #[test]
    fn authorization_url_includes_all_params() {
        let config = test_config();
        let challenge = pkce_challenge("test-verifier");
        let url_str = authorization_url(&config, &challenge, "random-state").unwrap();

        let url = Url::parse(&url_str).unwrap();
        assert_eq!(url.path(), "/oauth2/authorize");
        let params: HashMap<_, _> = url.query_pairs().collect();

        assert_eq!(params.get("response_type").unwrap(), "code");
        assert_eq!(params.get("code_challenge_method").unwrap(), "S256");
        assert_eq!(params.get("client_id").unwrap(), "test-client-id");
        assert_eq!(
            params.get("redirect_uri").unwrap(),
            "http://127.0.0.1:8400/callback"
        );
        assert_eq!(params.get("scope").unwrap(), "read write");
        assert_eq!(params.get("state").unwrap(), "random-state");
        assert_eq!(params.get("code_challenge").unwrap(), challenge.as_str());
    }

    #[test]
    fn authorization_url_without_scopes() {
        let config = test_config().with_scopes(Vec::<String>::new());
        let url_str = authorization_url(&config, "challenge", "state").unwrap();

        let url = Url::parse(&url_str).unwrap();
        let params: HashMap<_, _> = url.query_pairs().collect();
        assert!(!params.contains_key("scope"));
    }

    #[test]
    fn authorization_url_rejects_unparseable_issuer() {
        let config = AuthConfig::new("not a url", "client");
        let result = authorization_url(&config, "challenge", "state");
        assert!(matches!(result, Err(AuthError::UrlParse(_))));
    }

    #[test]
    fn token_response_parsing() {
        let json = r#"{
            "access_token": "at_abc123",
            "refresh_token": "rt_def456",
            "expires_in": 3600,
            "token_type": "Bearer"
        }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        let token = response.into_token(None).unwrap();

        assert_eq!(token.access_token, "at_abc123");
        assert_eq!(token.refresh_token(), Some("rt_def456"));
        let expiry = token.expiry.unwrap();
        assert!(expiry > Utc::now() + chrono::Duration::seconds(3500));
    }

    #[test]
    fn token_response_minimal() {
        let json = r#"{ "access_token": "tok_minimal" }"#;

        let response: TokenResponse = serde_json::from_str(json).unwrap();
        let token = response.into_token(None).unwrap();

        assert_eq!(token.access_token, "tok_minimal");
        assert!(token.refresh_token().is_none());
        assert!(token.expiry.is_none());
    }

    #[test]
    fn refresh_response_keeps_previous_refresh_token() {
        let json = r#"{ "access_token": "new", "expires_in": 60 }"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        let token = response.into_token(Some("old-refresh")).unwrap();
        assert_eq!(token.refresh_token(), Some("old-refresh"));
    }

    #[test]
    fn quoted_expires_in_is_accepted() {
        let json = r#"{ "access_token": "at", "expires_in": "3600" }"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        let expiry = response.into_token(None).unwrap().expiry.unwrap();
        assert!(expiry > Utc::now() + chrono::Duration::seconds(3500));
    }

    #[test]
    fn non_numeric_expires_in_is_rejected() {
        let json = r#"{ "access_token": "at", "expires_in": "soon" }"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert!(response.into_token(None).is_err());
    }

    #[test]
    fn non_positive_expires_in_means_unknown_expiry() {
        let json = r#"{ "access_token": "at", "expires_in": 0 }"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        assert!(response.into_token(None).unwrap().expiry.is_none());
    }

    #[tokio::test]
    async fn huge_expires_in_is_a_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "refresh_token": "rt",
                "expires_in": i64::MAX
            })))
            .expect(2)
            .mount(&server)
            .await;

        let mut config = test_config();
        config.issuer = server.uri();
        let flow = OAuthFlow::new(config);

        match flow.exchange_code("abc", "verifier").await {
            Err(AuthError::ExchangeFailed { status, body }) => {
                assert_eq!(status, Some(200));
                assert!(body.contains("malformed token response"));
            }
            other => panic!("expected ExchangeFailed, got: {other:?}"),
        }
        assert!(matches!(
            flow.refresh_token("rt").await,
            Err(AuthError::RefreshFailed {
                status: Some(200),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn exchange_code_posts_verifier_without_scope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .and(body_string_contains("code_verifier=the-verifier"))
            .and(body_string_contains("client_id=test-client-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "refresh_token": "rt",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config();
        config.issuer = server.uri();
        let flow = OAuthFlow::new(config);
        let token = flow.exchange_code("abc", "the-verifier").await.unwrap();
        assert_eq!(token.access_token, "at");
        assert_eq!(token.refresh_token(), Some("rt"));

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(!body.contains("scope="));
    }

    #[tokio::test]
    async fn exchange_code_failure_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"error":"invalid_grant","error_description":"code expired"}"#,
            ))
            .mount(&server)
            .await;

        let mut config = test_config();
        config.issuer = server.uri();
        let flow = OAuthFlow::new(config);
        match flow.exchange_code("abc", "verifier").await {
            Err(AuthError::ExchangeFailed { status, body }) => {
                assert_eq!(status, Some(400));
                assert!(body.contains("code expired"));
            }
            other => panic!("expected ExchangeFailed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_token_failure_is_refresh_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt"))
            .respond_with(ResponseTemplate::new(401).set_body_string("revoked"))
            .mount(&server)
            .await;

        let mut config = test_config();
        config.issuer = server.uri();
        let flow = OAuthFlow::new(config);
        match flow.refresh_token("rt").await {
            Err(AuthError::RefreshFailed { status, body }) => {
                assert_eq!(status, Some(401));
                assert_eq!(body, "revoked");
            }
            other => panic!("expected RefreshFailed, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exchange_transport_error_has_no_status() {
        // Nothing serves the discard port on loopback.
        let config = AuthConfig::new("http://127.0.0.1:9", "client");
        let flow = OAuthFlow::new(config);
        match flow.exchange_code("abc", "verifier").await {
            Err(AuthError::ExchangeFailed { status, .. }) => assert!(status.is_none()),
            other => panic!("expected ExchangeFailed, got: {other:?}"),
        }
    }

    #[test]
    fn oauth_flow_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OAuthFlow>();
        assert_send_sync::<AuthConfig>();
        assert_send_sync::<Token>();
    }
}
