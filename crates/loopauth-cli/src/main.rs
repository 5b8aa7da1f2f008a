//! CLI entry point for loopauth.
//!
//! This binary provides the `loopauth` command: sign in through the system
//! browser, inspect the stored session, and call a protected API with it.

mod file_store;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loopauth_engine::{AuthError, AuthManager, BrowserOpener};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::file_store::FileTokenStore;
use crate::settings::Settings;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// loopauth — browser login for command-line tools.
#[derive(Parser)]
#[command(
    name = "loopauth",
    version,
    about = "Sign in with OAuth 2.0 + PKCE over a loopback redirect",
    long_about = "Opens the identity provider's login page in your browser, receives the \
                  redirect on a local port, and keeps the resulting token fresh for API calls."
)]
struct Cli {
    /// Path to the TOML settings file.
    #[arg(long, global = true, default_value = "loopauth.toml")]
    config: PathBuf,

    /// Where the token is stored.
    #[arg(long, global = true, default_value = ".loopauth/token.json")]
    token_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in through the browser and store the token.
    Login,

    /// Show the stored token's expiry, refreshing it if needed.
    Token {
        /// Refresh even if the access token is still fresh.
        #[arg(long)]
        force_refresh: bool,
    },

    /// Perform an authenticated GET request and print the response.
    Get {
        /// The URL to request.
        url: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("info");

    let config = Settings::load(&cli.config)?.into_auth_config()?;
    let store = Arc::new(FileTokenStore::new(&cli.token_file));
    let manager = AuthManager::new(config, SystemBrowser, store);

    match cli.command {
        Commands::Login => cmd_login(&manager).await,
        Commands::Token { force_refresh } => cmd_token(&manager, force_refresh).await,
        Commands::Get { url } => cmd_get(&manager, &url).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: login
// ---------------------------------------------------------------------------

async fn cmd_login(manager: &AuthManager) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let token = manager.login(&cancel).await.context("login failed")?;

    println!("Logged in.");
    print_expiry(&token);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: token
// ---------------------------------------------------------------------------

async fn cmd_token(manager: &AuthManager, force_refresh: bool) -> Result<()> {
    let token = manager
        .get_valid_token(force_refresh)
        .await
        .map_err(with_login_hint)?;

    print_expiry(&token);
    println!(
        "Refresh token: {}",
        if token.refresh_token().is_some() {
            "present"
        } else {
            "none"
        }
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: get
// ---------------------------------------------------------------------------

async fn cmd_get(manager: &AuthManager, url: &str) -> Result<()> {
    let response = manager
        .http_client()
        .get(url)
        .await
        .map_err(with_login_hint)?;

    let status = response.status();
    let body = response
        .text()
        .await
        .context("failed to read response body")?;

    println!("{status}");
    println!("{body}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Opens the system browser, falling back to printing the URL.
struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) {
        info!(url = %url, "open this URL in your browser to sign in");
        if let Err(e) = webbrowser::open(url) {
            warn!(error = %e, "could not open the browser automatically");
        }
    }
}

fn with_login_hint(err: AuthError) -> anyhow::Error {
    if err.requires_login() {
        anyhow::Error::new(err).context("session is no longer valid; run `loopauth login`")
    } else {
        err.into()
    }
}

fn print_expiry(token: &loopauth_engine::Token) {
    match token.expiry {
        Some(expiry) => println!("Access token expires at {}", expiry.to_rfc3339()),
        None => println!("Access token expiry unknown"),
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}
