//! Error taxonomy for the clangd client.
//!
//! Framing errors are `anyhow` inside the codec; the connection logs them and
//! fails outstanding calls with `Transport`.

use std::fmt;

use crate::types::LifecycleState;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    /// The server process or one of its pipes could not be set up.
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// The pipe to the server broke after spawn.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The initialize exchange failed or the server lacks a required capability.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The server answered a request with a JSON-RPC error.
    #[error("`{method}` failed with code {code}: {message}")]
    Call {
        method: String,
        code: i64,
        message: String,
    },

    /// The server's reply did not have the expected shape.
    #[error("unexpected `{method}` reply: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("`{method}` timed out")]
    Timeout { method: String },

    /// An inbound message could not be decoded. Logged and dropped by the router.
    #[error("malformed `{method}` message: {reason}")]
    NotificationDecode { method: String, reason: String },

    #[error("cannot read document {uri}")]
    DocumentIo {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not a local file URI: {0}")]
    InvalidDocumentUri(String),

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error("language server is not ready (state: {state})")]
    NotReady { state: LifecycleState },

    #[error("wait cancelled")]
    Cancelled,
}

impl LspError {
    /// Fatal errors end the manager's lifecycle; everything else is returned
    /// to the immediate caller.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. } | Self::Transport(_) | Self::Handshake(_)
        )
    }
}

/// Every failure collected during a best-effort teardown sequence.
#[derive(Debug, Default)]
pub struct TeardownError {
    failures: Vec<String>,
}

impl TeardownError {
    pub(crate) fn push(&mut self, failure: impl Into<String>) {
        self.failures.push(failure.into());
    }

    pub(crate) fn into_result(self) -> Result<(), Self> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    #[must_use]
    pub fn failures(&self) -> &[String] {
        &self.failures
    }
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "teardown failed: {}", self.failures.join(", "))
    }
}

impl std::error::Error for TeardownError {}
