//! Tracks which documents the server has been told are open.

use std::future::Future;

use tokio::sync::Mutex;
use url::Url;

use crate::client::ClangdClient;
use crate::error::{LspError, TeardownError};
use crate::protocol::file_uri_to_path;

/// The two document notifications the collection needs from a client.
pub trait TextDocumentNotifier: Send + Sync {
    fn did_open(
        &self,
        uri: &Url,
        language_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), LspError>> + Send;

    fn did_close(&self, uri: &Url) -> impl Future<Output = Result<(), LspError>> + Send;
}

/// The set of open documents.
///
/// A URI is recorded only after `didOpen` was sent for it, and removed
/// before `didClose` is sent. The same URI may be opened more than once;
/// each open is a separate entry.
pub struct DocumentCollection<N = ClangdClient> {
    notifier: N,
    language_id: String,
    // Never held across an await.
    open: Mutex<Vec<Url>>,
}

impl<N: TextDocumentNotifier> DocumentCollection<N> {
    pub fn new(notifier: N, language_id: impl Into<String>) -> Self {
        Self {
            notifier,
            language_id: language_id.into(),
            open: Mutex::new(Vec::new()),
        }
    }

    /// Read the file behind `uri` and open it on the server.
    pub async fn open(&self, uri: &Url) -> Result<(), LspError> {
        let path =
            file_uri_to_path(uri).ok_or_else(|| LspError::InvalidDocumentUri(uri.to_string()))?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| LspError::DocumentIo {
                uri: uri.to_string(),
                source,
            })?;
        let text = String::from_utf8_lossy(&bytes);

        self.notifier
            .did_open(uri, &self.language_id, &text)
            .await?;
        self.open.lock().await.push(uri.clone());
        tracing::debug!(%uri, bytes = bytes.len(), "document opened");
        Ok(())
    }

    /// Forget one entry for `uri` and send `didClose`. The notification is
    /// sent even when the URI was not tracked.
    pub async fn close(&self, uri: &Url) -> Result<(), LspError> {
        {
            let mut open = self.open.lock().await;
            if let Some(index) = open.iter().position(|u| u == uri) {
                open.remove(index);
            } else {
                tracing::debug!(%uri, "closing a document that was not open");
            }
        }
        self.notifier.did_close(uri).await
    }

    /// Close every tracked document. All of them are attempted; failures are
    /// collected and the collection ends up empty either way.
    pub async fn close_all(&self) -> Result<(), LspError> {
        let open = std::mem::take(&mut *self.open.lock().await);
        let mut teardown = TeardownError::default();
        for uri in &open {
            if let Err(e) = self.notifier.did_close(uri).await {
                tracing::warn!(%uri, "didClose failed: {e}");
                teardown.push(format!("closing {uri}: {e}"));
            }
        }
        teardown.into_result().map_err(LspError::from)
    }

    pub async fn len(&self) -> usize {
        self.open.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.open.lock().await.is_empty()
    }

    /// Open URIs in the order they were opened.
    pub async fn uris(&self) -> Vec<Url> {
        self.open.lock().await.clone()
    }
}
