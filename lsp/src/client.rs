//! Typed clangd requests and notifications over a [`Connection`].

use url::Url;

use crate::connection::Connection;
use crate::documents::TextDocumentNotifier;
use crate::error::LspError;
use crate::protocol::{
    InitializeParams, InitializeResult, did_close_params, did_open_params,
    workspace_symbol_params,
};
use crate::types::{ClangdConfig, SymbolInformation};

/// Documents are opened once and never edited, so every open is version 0.
const INITIAL_VERSION: i32 = 0;

#[derive(Clone)]
pub struct ClangdClient {
    connection: Connection,
}

impl ClangdClient {
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Send `initialize` and decode the reply as both the standard and the
    /// clangd-extended result.
    ///
    /// Any failure other than a broken transport is reported as a handshake
    /// failure.
    pub async fn initialize(
        &self,
        config: &ClangdConfig,
        root_uri: &Url,
    ) -> Result<InitializeResult, LspError> {
        let params = serde_json::to_value(InitializeParams::new(config, root_uri))
            .map_err(|e| LspError::Handshake(format!("serializing initialize params: {e}")))?;

        let payload = match self.connection.call("initialize", Some(params)).await {
            Ok(payload) => payload,
            Err(e @ LspError::Transport(_)) => return Err(e),
            Err(e) => return Err(LspError::Handshake(e.to_string())),
        };

        InitializeResult::from_payload(&payload)
    }

    pub async fn initialized(&self) -> Result<(), LspError> {
        self.connection
            .notify("initialized", Some(serde_json::json!({})))
            .await
    }

    /// The `shutdown` request. Its result carries nothing.
    pub async fn shutdown(&self) -> Result<(), LspError> {
        self.connection.call("shutdown", None).await.map(drop)
    }

    pub async fn exit(&self) -> Result<(), LspError> {
        self.connection.notify("exit", None).await
    }

    pub async fn did_open(&self, uri: &Url, language_id: &str, text: &str) -> Result<(), LspError> {
        self.connection
            .notify(
                "textDocument/didOpen",
                Some(did_open_params(
                    uri.as_str(),
                    language_id,
                    INITIAL_VERSION,
                    text,
                )),
            )
            .await
    }

    pub async fn did_close(&self, uri: &Url) -> Result<(), LspError> {
        self.connection
            .notify("textDocument/didClose", Some(did_close_params(uri.as_str())))
            .await
    }

    /// `workspace/symbol`. A `null` result means no matches.
    pub async fn find_symbols(&self, query: &str) -> Result<Vec<SymbolInformation>, LspError> {
        const METHOD: &str = "workspace/symbol";

        let result = self
            .connection
            .call(METHOD, Some(workspace_symbol_params(query)))
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }

        let symbols: Vec<SymbolInformation> =
            serde_json::from_value(result).map_err(|e| LspError::InvalidResponse {
                method: METHOD.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(query, count = symbols.len(), "workspace symbols");
        Ok(symbols)
    }
}

impl TextDocumentNotifier for ClangdClient {
    async fn did_open(&self, uri: &Url, language_id: &str, text: &str) -> Result<(), LspError> {
        ClangdClient::did_open(self, uri, language_id, text).await
    }

    async fn did_close(&self, uri: &Url) -> Result<(), LspError> {
        ClangdClient::did_close(self, uri).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Handler, Inbound};
    use crate::protocol::SYMBOLS_TOKEN;
    use crate::testing::{FakeServer, WAIT, clangd_capabilities};

    struct Ignore;

    impl Handler for Ignore {
        fn handle(&self, _message: &Inbound) -> serde_json::Value {
            serde_json::Value::Null
        }
    }

    fn client() -> (ClangdClient, FakeServer) {
        let ((reader, writer), server) = FakeServer::pair();
        let connection = Connection::serve(reader, writer, Ignore, WAIT);
        (ClangdClient::new(connection), server)
    }

    fn root() -> Url {
        Url::parse("file:///fw/qmk_firmware").unwrap()
    }

    #[tokio::test]
    async fn test_initialize_decodes_merged_result() {
        let (client, mut server) = client();
        let config = ClangdConfig::default();
        let root = root();

        let (result, ()) = tokio::join!(client.initialize(&config, &root), async {
            let request = server.expect("initialize").await;
            assert_eq!(request["params"]["rootUri"], "file:///fw/qmk_firmware");
            server.reply(&request, clangd_capabilities()).await;
        });

        let result = result.unwrap();
        assert!(result.ast_provider());
        assert!(result.workspace_symbol_provider());
    }

    #[tokio::test]
    async fn test_initialize_error_reply_is_handshake_failure() {
        let (client, mut server) = client();
        let config = ClangdConfig::default();
        let root = root();

        let (result, ()) = tokio::join!(client.initialize(&config, &root), async {
            let request = server.expect("initialize").await;
            server.reply_error(&request, -32603, "bad workspace").await;
        });

        match result.unwrap_err() {
            LspError::Handshake(reason) => assert!(reason.contains("bad workspace")),
            other => panic!("expected Handshake, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initialize_without_ast_provider_fails() {
        let (client, mut server) = client();
        let config = ClangdConfig::default();
        let root = root();

        let (result, ()) = tokio::join!(client.initialize(&config, &root), async {
            let request = server.expect("initialize").await;
            server
                .reply(
                    &request,
                    serde_json::json!({ "capabilities": { "workspaceSymbolProvider": true } }),
                )
                .await;
        });

        assert!(matches!(result, Err(LspError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_find_symbols_null_is_empty() {
        let (client, mut server) = client();

        let (result, ()) = tokio::join!(client.find_symbols("NO_SUCH"), async {
            let request = server.expect("workspace/symbol").await;
            assert_eq!(request["params"]["workDoneToken"], SYMBOLS_TOKEN);
            server.reply(&request, serde_json::Value::Null).await;
        });

        assert!(result.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_symbols_decodes_results() {
        let (client, mut server) = client();

        let (result, ()) = tokio::join!(client.find_symbols("KC_"), async {
            let request = server.expect("workspace/symbol").await;
            server
                .reply(
                    &request,
                    serde_json::json!([{
                        "name": "KC_ESCAPE",
                        "kind": 22,
                        "containerName": "hid_keyboard_keypad_usage",
                        "location": {
                            "uri": "file:///fw/tmk_core/protocol/keycode.h",
                            "range": {
                                "start": { "line": 10, "character": 4 },
                                "end": { "line": 10, "character": 13 }
                            }
                        },
                        "score": 0.7
                    }]),
                )
                .await;
        });

        let symbols = result.unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "KC_ESCAPE");
        assert_eq!(symbols[0].location.range.start.line, 10);
    }

    #[tokio::test]
    async fn test_find_symbols_rejects_malformed_reply() {
        let (client, mut server) = client();

        let (result, ()) = tokio::join!(client.find_symbols("KC_"), async {
            let request = server.expect("workspace/symbol").await;
            server
                .reply(&request, serde_json::json!({ "not": "a list" }))
                .await;
        });

        assert!(matches!(result, Err(LspError::InvalidResponse { .. })));
    }

    #[tokio::test]
    async fn test_document_notifications() {
        let (client, mut server) = client();
        let uri = Url::parse("file:///fw/keymap.c").unwrap();

        client.did_open(&uri, "c", "int x;\n").await.unwrap();
        client.did_close(&uri).await.unwrap();

        let open = server.expect("textDocument/didOpen").await;
        assert_eq!(open["params"]["textDocument"]["uri"], "file:///fw/keymap.c");
        assert_eq!(open["params"]["textDocument"]["version"], 0);
        assert_eq!(open["params"]["textDocument"]["text"], "int x;\n");

        let close = server.expect("textDocument/didClose").await;
        assert_eq!(close["params"]["textDocument"]["uri"], "file:///fw/keymap.c");
    }

    #[tokio::test]
    async fn test_shutdown_then_exit() {
        let (client, mut server) = client();

        let (result, ()) = tokio::join!(client.shutdown(), async {
            let request = server.expect("shutdown").await;
            assert!(request.get("params").is_none());
            server.reply(&request, serde_json::Value::Null).await;
        });
        result.unwrap();

        client.exit().await.unwrap();
        let exit = server.expect("exit").await;
        assert!(exit.get("id").is_none());
    }
}
