//! Dispatch of server-initiated messages.
//!
//! Every inbound notification and server request lands here. Only
//! background-index progress changes client state; the rest is logged.
//! Server requests are always answered with `null`.

use serde::de::DeserializeOwned;

use crate::connection::{Handler, Inbound};
use crate::error::LspError;
use crate::protocol::{
    FileStatusParams, LogMessageParams, ProgressEnvelope, ProgressKind, PublishDiagnosticsParams,
    WorkDoneProgressCreateParams, WorkDoneProgressParams,
};
use crate::signal::IndexSignal;
use crate::types::BACKGROUND_INDEX_TOKEN;

/// Methods the router knows by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerMethod<'a> {
    Progress,
    WorkDoneProgressCreate,
    PublishDiagnostics,
    FileStatus,
    LogMessage,
    Unknown(&'a str),
}

impl<'a> ServerMethod<'a> {
    pub fn parse(method: &'a str) -> Self {
        match method {
            "$/progress" => Self::Progress,
            "window/workDoneProgress/create" => Self::WorkDoneProgressCreate,
            "textDocument/publishDiagnostics" => Self::PublishDiagnostics,
            "textDocument/clangd.fileStatus" => Self::FileStatus,
            "window/logMessage" => Self::LogMessage,
            other => Self::Unknown(other),
        }
    }
}

/// Routes inbound messages and publishes the index signal when clangd
/// reports the end of background indexing.
#[derive(Debug, Clone)]
pub struct NotificationRouter {
    index: IndexSignal,
}

impl NotificationRouter {
    #[must_use]
    pub fn new(index: IndexSignal) -> Self {
        Self { index }
    }

    pub(crate) fn route(&self, message: &Inbound) -> Result<(), LspError> {
        match ServerMethod::parse(&message.method) {
            ServerMethod::Progress => self.on_progress(message),
            ServerMethod::WorkDoneProgressCreate => {
                let params: WorkDoneProgressCreateParams = decode(message)?;
                tracing::debug!(token = ?params.token, "server created progress token");
                Ok(())
            }
            ServerMethod::PublishDiagnostics => {
                let params: PublishDiagnosticsParams = decode(message)?;
                tracing::debug!(
                    uri = %params.uri,
                    count = params.diagnostics.len(),
                    "diagnostics published"
                );
                Ok(())
            }
            ServerMethod::FileStatus => {
                let params: FileStatusParams = decode(message)?;
                tracing::trace!(uri = %params.uri, state = %params.state, "file status");
                Ok(())
            }
            ServerMethod::LogMessage => {
                let params: LogMessageParams = decode(message)?;
                match params.level {
                    1 => tracing::error!(target: "clangd", "{}", params.message),
                    2 => tracing::warn!(target: "clangd", "{}", params.message),
                    3 => tracing::info!(target: "clangd", "{}", params.message),
                    _ => tracing::debug!(target: "clangd", "{}", params.message),
                }
                Ok(())
            }
            ServerMethod::Unknown(method) => {
                tracing::debug!(method, request = message.is_request(), "unhandled server message");
                Ok(())
            }
        }
    }

    fn on_progress(&self, message: &Inbound) -> Result<(), LspError> {
        let envelope: ProgressEnvelope = decode(message)?;
        if !envelope.token.matches(BACKGROUND_INDEX_TOKEN) {
            tracing::trace!(token = ?envelope.token, "progress for another token");
            return Ok(());
        }

        let progress: WorkDoneProgressParams = decode(message)?;
        let value = progress.value;
        match value.kind {
            ProgressKind::Begin => {
                tracing::info!(title = value.title.as_deref(), "background indexing started");
            }
            ProgressKind::Report => {
                tracing::debug!(
                    message = value.message.as_deref(),
                    percentage = value.percentage,
                    "background indexing"
                );
            }
            ProgressKind::End => {
                if self.index.publish() {
                    tracing::info!("background indexing finished");
                } else {
                    tracing::debug!("background indexing finished again");
                }
            }
        }
        Ok(())
    }
}

impl Handler for NotificationRouter {
    fn handle(&self, message: &Inbound) -> serde_json::Value {
        if let Err(e) = self.route(message) {
            tracing::warn!("{e}");
        }
        serde_json::Value::Null
    }
}

fn decode<T: DeserializeOwned>(message: &Inbound) -> Result<T, LspError> {
    let decode_error = |reason: String| LspError::NotificationDecode {
        method: message.method.clone(),
        reason,
    };
    let params = message
        .params
        .as_ref()
        .ok_or_else(|| decode_error(String::from("missing params")))?;
    T::deserialize(params).map_err(|e| decode_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(method: &str, params: serde_json::Value) -> Inbound {
        Inbound {
            id: None,
            method: method.to_string(),
            params: Some(params),
        }
    }

    fn progress(token: serde_json::Value, kind: &str) -> Inbound {
        notification(
            "$/progress",
            serde_json::json!({ "token": token, "value": { "kind": kind, "title": "indexing" } }),
        )
    }

    #[test]
    fn test_method_names() {
        assert_eq!(ServerMethod::parse("$/progress"), ServerMethod::Progress);
        assert_eq!(
            ServerMethod::parse("window/workDoneProgress/create"),
            ServerMethod::WorkDoneProgressCreate
        );
        assert_eq!(
            ServerMethod::parse("textDocument/publishDiagnostics"),
            ServerMethod::PublishDiagnostics
        );
        assert_eq!(
            ServerMethod::parse("textDocument/clangd.fileStatus"),
            ServerMethod::FileStatus
        );
        assert_eq!(ServerMethod::parse("window/logMessage"), ServerMethod::LogMessage);
        assert_eq!(
            ServerMethod::parse("workspace/configuration"),
            ServerMethod::Unknown("workspace/configuration")
        );
    }

    #[test]
    fn test_index_end_publishes_signal() {
        let signal = IndexSignal::new();
        let router = NotificationRouter::new(signal.clone());

        router
            .route(&progress(serde_json::json!(BACKGROUND_INDEX_TOKEN), "begin"))
            .unwrap();
        router
            .route(&progress(serde_json::json!(BACKGROUND_INDEX_TOKEN), "report"))
            .unwrap();
        assert!(!signal.is_published());

        router
            .route(&progress(serde_json::json!(BACKGROUND_INDEX_TOKEN), "end"))
            .unwrap();
        assert!(signal.is_published());

        // A second end is harmless.
        router
            .route(&progress(serde_json::json!(BACKGROUND_INDEX_TOKEN), "end"))
            .unwrap();
        assert!(signal.is_published());
    }

    #[test]
    fn test_other_tokens_do_not_publish() {
        let signal = IndexSignal::new();
        let router = NotificationRouter::new(signal.clone());

        router
            .route(&progress(serde_json::json!("symbols"), "end"))
            .unwrap();
        router.route(&progress(serde_json::json!(7), "end")).unwrap();

        assert!(!signal.is_published());
    }

    #[test]
    fn test_malformed_params_are_reported_not_fatal() {
        let signal = IndexSignal::new();
        let router = NotificationRouter::new(signal.clone());

        let bad_kind = progress(serde_json::json!(BACKGROUND_INDEX_TOKEN), "finished");
        assert!(matches!(
            router.route(&bad_kind),
            Err(LspError::NotificationDecode { .. })
        ));

        let no_params = Inbound {
            id: None,
            method: "textDocument/publishDiagnostics".into(),
            params: None,
        };
        match router.route(&no_params) {
            Err(LspError::NotificationDecode { method, reason }) => {
                assert_eq!(method, "textDocument/publishDiagnostics");
                assert_eq!(reason, "missing params");
            }
            other => panic!("expected decode error, got {other:?}"),
        }

        assert!(router.handle(&bad_kind).is_null());
        assert!(!signal.is_published());
    }

    #[test]
    fn test_every_message_is_answered_with_null() {
        let router = NotificationRouter::new(IndexSignal::new());
        let messages = [
            Inbound {
                id: Some(serde_json::json!(0)),
                method: "window/workDoneProgress/create".into(),
                params: Some(serde_json::json!({ "token": BACKGROUND_INDEX_TOKEN })),
            },
            notification(
                "textDocument/publishDiagnostics",
                serde_json::json!({ "uri": "file:///fw/keymap.c", "diagnostics": [] }),
            ),
            notification(
                "textDocument/clangd.fileStatus",
                serde_json::json!({ "uri": "file:///fw/keymap.c", "state": "parsing includes" }),
            ),
            notification(
                "window/logMessage",
                serde_json::json!({ "type": 3, "message": "indexed 480 files" }),
            ),
            Inbound {
                id: Some(serde_json::json!("cfg-1")),
                method: "workspace/configuration".into(),
                params: None,
            },
        ];

        for message in &messages {
            assert!(router.route(message).is_ok(), "{}", message.method);
            assert!(router.handle(message).is_null());
        }
    }
}
