//! Bearer-token HTTP transport with one refresh-and-retry on 401.
//!
//! [`AuthenticatedClient`] decorates a [`reqwest::Client`]. Every request is
//! sent with a token from the [`TokenCache`]; if the API still answers
//! `401 Unauthorized`, the token is force-refreshed and the request is sent
//! exactly once more. Whatever the retry returns is handed back verbatim.

use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{IntoUrl, Method, Request, RequestBuilder, Response, StatusCode};

use crate::cache::TokenCache;
use crate::error::{AuthError, Result};
use crate::token::Token;

/// HTTP client that authenticates every request with the cached token.
#[derive(Clone)]
pub struct AuthenticatedClient {
    cache: Arc<TokenCache>,
    client: reqwest::Client,
}

impl AuthenticatedClient {
    /// Wrap `client`, taking tokens from `cache`.
    pub fn new(cache: Arc<TokenCache>, client: reqwest::Client) -> Self {
        Self { cache, client }
    }

    /// Start building a request; send it with [`AuthenticatedClient::execute`].
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Authenticated `GET`.
    ///
    /// # Errors
    ///
    /// See [`AuthenticatedClient::execute`].
    pub async fn get<U: IntoUrl>(&self, url: U) -> Result<Response> {
        let request = self.client.get(url).build()?;
        self.execute(request).await
    }

    /// Send `request` with a bearer token, retrying once after a forced
    /// refresh if the response is `401`.
    ///
    /// Non-401 responses, including other errors, are returned unchanged.
    ///
    /// # Errors
    ///
    /// - [`AuthError::RequestNotCloneable`] for streaming bodies, before any
    ///   network call.
    /// - Token cache errors ([`AuthError::NoRefreshToken`],
    ///   [`AuthError::RefreshFailed`], store failures).
    /// - [`AuthError::Network`] if the underlying transport fails.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let first = request.try_clone().ok_or(AuthError::RequestNotCloneable)?;

        let token = self.cache.get_valid_token(false).await?;
        let response = self.client.execute(authorize(first, &token)?).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!(
            method = %request.method(),
            url = %request.url(),
            "request unauthorized, forcing token refresh and retrying once"
        );
        drop(response);

        let token = self.cache.get_valid_token(true).await?;
        let retry = request.try_clone().ok_or(AuthError::RequestNotCloneable)?;
        Ok(self.client.execute(authorize(retry, &token)?).await?)
    }
}

fn authorize(mut request: Request, token: &Token) -> Result<Request> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.access_token))
        .map_err(|_| AuthError::InvalidAccessToken)?;
    value.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

impl std::fmt::Debug for AuthenticatedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedClient")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::oauth::OAuthFlow;
    use crate::token::MemoryTokenStore;
    use chrono::Utc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token(access: &str, refresh: &str, expires_in_secs: i64) -> Token {
        Token {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            expiry: Some(Utc::now() + chrono::Duration::seconds(expires_in_secs)),
        }
    }

    fn client_for(server: &MockServer, stored: Token) -> (AuthenticatedClient, Arc<MemoryTokenStore>) {
        let store = Arc::new(MemoryTokenStore::with_token(stored));
        let config = AuthConfig::new(server.uri(), "client");
        let cache = Arc::new(TokenCache::new(OAuthFlow::new(config), store.clone()));
        (AuthenticatedClient::new(cache, reqwest::Client::new()), store)
    }

    async fn mount_refresh(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "refresh_token": "new-refresh",
                "expires_in": 3600
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    async fn mount_api(server: &MockServer, bearer: &str, status: u16, expected_calls: u64) {
        Mock::given(method("GET"))
            .and(path("/api/v1/stores"))
            .and(header("Authorization", format!("Bearer {bearer}").as_str()))
            .respond_with(ResponseTemplate::new(status).set_body_string(format!("status {status}")))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn success_does_not_refresh() {
        let server = MockServer::start().await;
        mount_refresh(&server, 0).await;
        mount_api(&server, "old-access", 200, 1).await;

        let (client, _) = client_for(&server, token("old-access", "old-refresh", 3600));
        let response = client
            .get(format!("{}/api/v1/stores", server.uri()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "status 200");
    }

    #[tokio::test]
    async fn unauthorized_refreshes_and_retries_once() {
        let server = MockServer::start().await;
        mount_refresh(&server, 1).await;
        mount_api(&server, "old-access", 401, 1).await;
        mount_api(&server, "new-access", 200, 1).await;

        let (client, store) = client_for(&server, token("old-access", "old-refresh", 3600));
        let response = client
            .get(format!("{}/api/v1/stores", server.uri()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.current().await.unwrap().access_token, "new-access");
    }

    #[tokio::test]
    async fn second_unauthorized_is_returned_as_is() {
        let server = MockServer::start().await;
        mount_refresh(&server, 1).await;
        mount_api(&server, "old-access", 401, 1).await;
        mount_api(&server, "new-access", 401, 1).await;

        let (client, _) = client_for(&server, token("old-access", "old-refresh", 3600));
        let response = client
            .get(format!("{}/api/v1/stores", server.uri()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn other_errors_pass_through_without_refresh() {
        let server = MockServer::start().await;
        mount_refresh(&server, 0).await;
        mount_api(&server, "old-access", 503, 1).await;

        let (client, _) = client_for(&server, token("old-access", "old-refresh", 3600));
        let response = client
            .get(format!("{}/api/v1/stores", server.uri()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.text().await.unwrap(), "status 503");
    }

    #[tokio::test]
    async fn failed_forced_refresh_is_propagated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .expect(1)
            .mount(&server)
            .await;
        mount_api(&server, "old-access", 401, 1).await;

        let (client, _) = client_for(&server, token("old-access", "old-refresh", 3600));
        let result = client.get(format!("{}/api/v1/stores", server.uri())).await;
        assert!(matches!(
            result,
            Err(AuthError::RefreshFailed {
                status: Some(400),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn expired_token_without_refresh_never_hits_api() {
        let server = MockServer::start().await;
        mount_refresh(&server, 0).await;
        mount_api(&server, "old-access", 200, 0).await;

        let (client, _) = client_for(&server, token("old-access", "", -1));
        let result = client.get(format!("{}/api/v1/stores", server.uri())).await;
        assert!(matches!(result, Err(AuthError::NoRefreshToken)));
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_sending() {
        let server = MockServer::start().await;
        mount_refresh(&server, 1).await;
        mount_api(&server, "old-access", 200, 0).await;
        mount_api(&server, "new-access", 200, 1).await;

        let (client, _) = client_for(&server, token("old-access", "old-refresh", -1));
        let response = client
            .get(format!("{}/api/v1/stores", server.uri()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn retry_replays_the_original_body() {
        let server = MockServer::start().await;
        mount_refresh(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/orders"))
            .and(header("Authorization", "Bearer old-access"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/orders"))
            .and(header("Authorization", "Bearer new-access"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _) = client_for(&server, token("old-access", "old-refresh", 3600));
        let request = client
            .request(Method::POST, format!("{}/api/v1/orders", server.uri()))
            .body(r#"{"item":"widget"}"#)
            .build()
            .unwrap();
        let response = client.execute(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let requests = server.received_requests().await.unwrap();
        let bodies: Vec<_> = requests
            .iter()
            .filter(|r| r.url.path() == "/api/v1/orders")
            .map(|r| String::from_utf8_lossy(&r.body).to_string())
            .collect();
        assert_eq!(bodies, vec![r#"{"item":"widget"}"#, r#"{"item":"widget"}"#]);
    }

    #[tokio::test]
    async fn streaming_body_is_rejected_before_any_call() {
        let server = MockServer::start().await;
        mount_refresh(&server, 0).await;

        let (client, _) = client_for(&server, token("old-access", "old-refresh", -1));
        let chunks = futures::stream::iter(vec![Ok::<_, std::io::Error>("chunk")]);
        let request = client
            .request(Method::POST, format!("{}/upload", server.uri()))
            .body(reqwest::Body::wrap_stream(chunks))
            .build()
            .unwrap();
        let result = client.execute(request).await;
        assert!(matches!(result, Err(AuthError::RequestNotCloneable)));
    }

    #[tokio::test]
    async fn concurrent_requests_refresh_once() {
        let server = MockServer::start().await;
        mount_refresh(&server, 1).await;
        mount_api(&server, "new-access", 200, 5).await;

        let (client, _) = client_for(&server, token("old-access", "old-refresh", -1));
        let url = format!("{}/api/v1/stores", server.uri());
        let calls = (0..5).map(|_| client.get(url.as_str()));
        for response in futures::future::join_all(calls).await {
            assert_eq!(response.unwrap().status(), StatusCode::OK);
        }
    }

    #[test]
    fn authorize_marks_header_sensitive() {
        let request = reqwest::Client::new()
            .get("http://127.0.0.1/api")
            .build()
            .unwrap();
        let request = authorize(request, &token("secret", "", 60)).unwrap();
        let value = request.headers().get(AUTHORIZATION).unwrap();
        assert_eq!(value, "Bearer secret");
        assert!(value.is_sensitive());
    }

    #[test]
    fn authorize_rejects_header_breaking_token() {
        let request = reqwest::Client::new()
            .get("http://127.0.0.1/api")
            .build()
            .unwrap();
        let result = authorize(request, &token("bad\r\ntoken", "", 60));
        assert!(matches!(result, Err(AuthError::InvalidAccessToken)));
    }
}
