//! JSON file token store.

use std::path::PathBuf;
#[cfg(test)]
use std::path::Path;

use async_trait::async_trait;
use loopauth_engine::{StoreError, Token, TokenStore};
use tokio::io::AsyncWriteExt;

/// Persists the token as pretty-printed JSON at a fixed path.
///
/// Saves write a sibling temp file and rename it over the target, so a
/// crash mid-write never leaves a truncated token behind. On Unix the file
/// is readable by the owner only.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "token".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Token, StoreError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            format!("cannot read token file {}: {e}", self.path.display())
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save(&self, token: &Token) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(token)?;
        let tmp = self.temp_path();

        // A leftover temp file would keep its old mode; start from scratch.
        match tokio::fs::remove_file(&tmp).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), "token saved");
        Ok(())
    }
}
