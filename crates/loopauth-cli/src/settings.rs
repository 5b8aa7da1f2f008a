//! CLI settings.
//!
//! Reads `loopauth.toml` (or the `--config` path), then lets `LOOPAUTH_*`
//! environment variables override individual keys. A `.env` file in the
//! working directory is loaded into the environment first.
//!
//! ```toml
//! provider = "workos"            # "clerk", "workos" or "generic"
//! issuer = "https://example.authkit.app"
//! client_id = "client_123"
//! redirect_port = 21222
//! scopes = ["openid", "profile", "offline_access"]
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use loopauth_engine::AuthConfig;
use serde::Deserialize;

/// Which identity provider preset the settings build on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Generic,
    Clerk,
    Workos,
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generic" => Ok(Self::Generic),
            "clerk" => Ok(Self::Clerk),
            "workos" => Ok(Self::Workos),
            other => bail!("unknown provider '{other}' (expected clerk, workos or generic)"),
        }
    }
}

/// Settings as written in the TOML file. Every key is optional so the
/// environment can fill the gaps.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub provider: Provider,
    pub issuer: Option<String>,
    pub client_id: Option<String>,
    pub redirect_host: Option<String>,
    pub redirect_port: Option<u16>,
    pub scopes: Option<Vec<String>>,
    pub login_timeout_secs: Option<u64>,
    pub refresh_margin_secs: Option<u64>,
}

impl Settings {
    /// Load settings from `path` and the process environment.
    ///
    /// A missing file is not an error; the environment alone may be enough.
    pub fn load(path: &Path) -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to read .env file");
            }
        }

        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .with_context(|| format!("invalid config file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using environment");
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Parse the TOML form.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override keys from `LOOPAUTH_*` variables looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(provider) = var("LOOPAUTH_PROVIDER") {
            self.provider = provider.parse()?;
        }
        if let Some(issuer) = var("LOOPAUTH_ISSUER") {
            self.issuer = Some(issuer);
        }
        if let Some(client_id) = var("LOOPAUTH_CLIENT_ID") {
            self.client_id = Some(client_id);
        }
        if let Some(host) = var("LOOPAUTH_REDIRECT_HOST") {
            self.redirect_host = Some(host);
        }
        if let Some(port) = var("LOOPAUTH_REDIRECT_PORT") {
            let port = port
                .trim()
                .parse::<u16>()
                .with_context(|| format!("LOOPAUTH_REDIRECT_PORT is not a port: '{port}'"))?;
            self.redirect_port = Some(port);
        }
        if let Some(scopes) = var("LOOPAUTH_SCOPES") {
            self.scopes = Some(
                scopes
                    .split([' ', ','])
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
        Ok(())
    }

    /// Build the engine configuration from the provider preset.
    pub fn into_auth_config(self) -> Result<AuthConfig> {
        let Some(issuer) = self.issuer else {
            bail!("no issuer configured (set `issuer` or LOOPAUTH_ISSUER)");
        };
        let Some(client_id) = self.client_id else {
            bail!("no client id configured (set `client_id` or LOOPAUTH_CLIENT_ID)");
        };

        let mut config = match self.provider {
            Provider::Generic => AuthConfig::new(issuer, client_id),
            Provider::Clerk => AuthConfig::clerk(issuer, client_id),
            Provider::Workos => AuthConfig::workos(issuer, client_id),
        };
        if let Some(host) = self.redirect_host {
            config.redirect_host = host;
        }
        if let Some(port) = self.redirect_port {
            config.redirect_port = port;
        }
        if let Some(scopes) = self.scopes {
            config.scopes = scopes;
        }
        if let Some(secs) = self.login_timeout_secs {
            config.login_timeout_secs = secs;
        }
        if let Some(secs) = self.refresh_margin_secs {
            config.refresh_margin_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }
}
