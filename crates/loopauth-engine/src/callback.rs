//! Local HTTP callback listener for the OAuth redirect.
//!
//! When the user finishes signing in, the identity provider redirects the
//! browser to `http://{host}:{port}/callback?code=xxx&state=yyy`. The
//! [`CallbackListener`] serves that single route on a background task,
//! validates the `state`, and hands the authorization code to the waiting
//! login flow exactly once.
//!
//! ```text
//! Listening ──► CodeReceived ──┐
//!     │    ├──► StateMismatch ─┤
//!     │    ├──► MissingCode ───┼──► Stopped
//!     │    └──► Listener error ┘
//!     └── cancel / deadline ───────► Stopped
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AuthConfig, CALLBACK_PATH};
use crate::error::{AuthError, Result};

/// Plain-text body returned to the browser once the code is captured.
const SUCCESS_TEXT: &str = "Login complete. You can close this tab and return to the terminal.";

type Outcome = Result<String>;

// ---------------------------------------------------------------------------
// Shared handler state
// ---------------------------------------------------------------------------

/// State shared between the route handler, the server task and the owner.
struct CallbackShared {
    expected_state: String,
    delivery: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl CallbackShared {
    /// Deliver the login outcome. Returns `false` if one was already
    /// delivered or the listener is shutting down.
    fn deliver(&self, outcome: Outcome) -> bool {
        let sender = self
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                // The waiter may be gone already (cancelled); nothing to do then.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Make any further delivery impossible.
    fn close(&self) {
        self.delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Query parameters of the redirect.
///
/// A repeated key keeps its first value, so every request still goes
/// through the state and code checks.
#[derive(Debug, Default)]
struct CallbackParams {
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackParams {
    fn parse(query: Option<&str>) -> Self {
        let mut params = Self::default();
        let Some(query) = query else {
            return params;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let slot = match key.as_ref() {
                "state" => &mut params.state,
                "code" => &mut params.code,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }
}

async fn handle_callback(
    State(shared): State<Arc<CallbackShared>>,
    RawQuery(query): RawQuery,
) -> (StatusCode, &'static str) {
    let params = CallbackParams::parse(query.as_deref());

    if params.state.as_deref() != Some(shared.expected_state.as_str()) {
        tracing::warn!("rejected OAuth callback with mismatched state");
        shared.deliver(Err(AuthError::StateMismatch));
        return (StatusCode::BAD_REQUEST, "state mismatch");
    }

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        if let Some(error) = params.error {
            tracing::warn!(
                error = %error,
                description = params.error_description.as_deref().unwrap_or(""),
                "identity provider redirected with an error"
            );
        }
        shared.deliver(Err(AuthError::MissingCode));
        return (StatusCode::BAD_REQUEST, "missing code");
    };

    if shared.deliver(Ok(code)) {
        tracing::info!("callback received, authorization code captured");
        (StatusCode::OK, SUCCESS_TEXT)
    } else {
        tracing::debug!("ignoring callback for an already completed login");
        (StatusCode::CONFLICT, "login already completed")
    }
}

fn router(shared: Arc<CallbackShared>) -> Router {
    Router::new()
        .route(CALLBACK_PATH, get(handle_callback))
        .with_state(shared)
}

// ---------------------------------------------------------------------------
// CallbackListener
// ---------------------------------------------------------------------------

/// Ephemeral loopback HTTP server bound to one login attempt.
///
/// Always call [`CallbackListener::shutdown`] when the login ends; dropping
/// the listener also stops the server, without the grace period.
pub struct CallbackListener {
    local_addr: SocketAddr,
    shared: Arc<CallbackShared>,
    outcome: Option<oneshot::Receiver<Outcome>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
    grace: Duration,
}

impl CallbackListener {
    /// Bind the listener on `config.listen_addr()` and start serving.
    ///
    /// Returns once the socket is bound; connections are accepted on a
    /// background task.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Listener`] if the address cannot be bound.
    pub async fn start(config: &AuthConfig, state: impl Into<String>) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(AuthError::Listener)?;
        let local_addr = listener.local_addr().map_err(AuthError::Listener)?;

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let shared = Arc::new(CallbackShared {
            expected_state: state.into(),
            delivery: Mutex::new(Some(outcome_tx)),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(Arc::clone(&shared));
        let server_shared = Arc::clone(&shared);
        let server = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::warn!(error = %e, "callback listener stopped with an error");
                server_shared.deliver(Err(AuthError::Listener(e)));
            }
        });

        tracing::info!(addr = %local_addr, "callback listener waiting for OAuth redirect");

        Ok(Self {
            local_addr,
            shared,
            outcome: Some(outcome_rx),
            shutdown_tx: Some(shutdown_tx),
            server: Some(server),
            grace: config.shutdown_grace(),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the redirect.
    ///
    /// Resolves with the authorization code, or the first callback/server
    /// error. The outcome can be taken only once; later calls fail with
    /// [`AuthError::ListenerClosed`].
    ///
    /// # Errors
    ///
    /// - [`AuthError::StateMismatch`] / [`AuthError::MissingCode`] for a bad
    ///   redirect.
    /// - [`AuthError::Listener`] if the server failed.
    /// - [`AuthError::Cancelled`] if `cancel` fires first.
    /// - [`AuthError::DeadlineExceeded`] if `timeout` elapses first.
    pub async fn wait_for_code(
        &mut self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<String> {
        let Some(outcome) = self.outcome.as_mut() else {
            return Err(AuthError::ListenerClosed);
        };

        let result = tokio::select! {
            delivered = outcome => delivered.unwrap_or(Err(AuthError::ListenerClosed)),
            () = cancel.cancelled() => Err(AuthError::Cancelled),
            () = tokio::time::sleep(timeout) => Err(AuthError::DeadlineExceeded { timeout }),
        };

        self.outcome = None;
        result
    }

    /// Stop the server and release the socket.
    ///
    /// Stops accepting immediately; in-flight connections get the grace
    /// period, after which the server task is aborted. Idempotent.
    pub async fn shutdown(&mut self) {
        self.shared.close();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        let Some(mut server) = self.server.take() else {
            return;
        };

        if tokio::time::timeout(self.grace, &mut server).await.is_err() {
            tracing::warn!(
                grace_ms = self.grace.as_millis() as u64,
                "callback listener did not stop within grace period, aborting"
            );
            server.abort();
            let _ = server.await;
        }

        tracing::debug!(addr = %self.local_addr, "callback listener stopped");
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shared.close();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

impl std::fmt::Debug for CallbackListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackListener")
            .field("local_addr", &self.local_addr)
            .field("running", &self.server.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
