//! Browser launcher capability.

/// Opens the authorization URL for the user.
///
/// Fire-and-forget: the engine ignores whether opening succeeded, since the
/// URL is also logged for the user to open by hand.
pub trait BrowserOpener: Send + Sync {
    /// Open `url` in the user's browser.
    fn open(&self, url: &str);
}

impl<F> BrowserOpener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn open(&self, url: &str) {
        self(url)
    }
}

/// A [`BrowserOpener`] that only logs the URL.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnly;

impl BrowserOpener for LogOnly {
    fn open(&self, url: &str) {
        tracing::info!(url = %url, "open this URL in your browser to sign in");
    }
}
