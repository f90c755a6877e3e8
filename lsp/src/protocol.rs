//! Wire types for the subset of LSP the client speaks, plus clangd's
//! extensions to it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LspError;
use crate::types::ClangdConfig;

/// Work-done token attached to `workspace/symbol` requests.
pub(crate) const SYMBOLS_TOKEN: &str = "symbols";

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Successful reply to a server-initiated request. `result` is always
/// serialized, `null` included.
#[derive(Debug, Serialize)]
pub(crate) struct Response {
    pub jsonrpc: &'static str,
    pub id: serde_json::Value,
    pub result: serde_json::Value,
}

impl Response {
    pub fn new(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct WorkspaceFolder {
    pub uri: String,
    pub name: String,
}

/// clangd's `initializationOptions`. One flat object, no vendor namespace.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitializationOptions {
    pub clangd_file_status: bool,
}

/// Standard `initialize` params with clangd's initialization options.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitializeParams {
    pub process_id: u32,
    pub client_info: ClientInfo,
    pub locale: String,
    pub root_uri: String,
    pub capabilities: serde_json::Value,
    pub workspace_folders: Vec<WorkspaceFolder>,
    pub initialization_options: InitializationOptions,
}

impl InitializeParams {
    pub fn new(config: &ClangdConfig, root_uri: &url::Url) -> Self {
        Self {
            process_id: std::process::id(),
            client_info: ClientInfo {
                name: config.client_name.clone(),
                version: config.client_version.clone(),
            },
            locale: config.locale.clone(),
            root_uri: root_uri.to_string(),
            capabilities: client_capabilities(),
            workspace_folders: vec![WorkspaceFolder {
                uri: root_uri.to_string(),
                name: config.workspace_name(),
            }],
            initialization_options: InitializationOptions {
                clangd_file_status: config.file_status,
            },
        }
    }
}

fn client_capabilities() -> serde_json::Value {
    // File (1) through TypeParameter (26).
    let symbol_kinds: Vec<u32> = (1..=26).collect();
    serde_json::json!({
        "workspace": {
            "workspaceFolders": true,
            "semanticTokens": { "refreshSupport": true },
            "symbol": {
                "dynamicRegistration": true,
                "symbolKind": { "valueSet": symbol_kinds }
            }
        },
        "window": {
            "workDoneProgress": true
        },
        "textDocument": {
            "synchronization": { "dynamicRegistration": true },
            "publishDiagnostics": {
                "relatedInformation": true,
                "versionSupport": true,
                "codeDescriptionSupport": true,
                "dataSupport": true
            }
        }
    })
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

pub(crate) fn workspace_symbol_params(query: &str) -> serde_json::Value {
    serde_json::json!({
        "query": query,
        "workDoneToken": SYMBOLS_TOKEN
    })
}

/// `true`, or an options object (which also means supported).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BoolOrOptions {
    Bool(bool),
    Options(serde_json::Value),
}

impl BoolOrOptions {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Bool(enabled) => *enabled,
            Self::Options(_) => true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// The capabilities fields of the standard LSP result this client reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardCapabilities {
    #[serde(default)]
    pub workspace_symbol_provider: Option<BoolOrOptions>,
    #[serde(default)]
    pub document_symbol_provider: Option<BoolOrOptions>,
    #[serde(default)]
    pub text_document_sync: Option<serde_json::Value>,
}

/// Standard LSP `InitializeResult` shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardInitializeResult {
    pub capabilities: StandardCapabilities,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

/// clangd's additions under the same `capabilities` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClangdCapabilities {
    pub ast_provider: bool,
    #[serde(default)]
    pub memory_usage_provider: bool,
    #[serde(default)]
    pub inactive_regions_provider: bool,
}

/// clangd-extended `InitializeResult` shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ClangdInitializeResult {
    pub capabilities: ClangdCapabilities,
}

/// The answer to `initialize`, seen through both shapes at once.
///
/// The two shapes share the `capabilities` key, so one decode into a single
/// target would lose whichever half that target does not model. The raw
/// payload is decoded once per shape instead and both results are kept.
#[derive(Debug, Clone)]
pub struct InitializeResult {
    standard: StandardInitializeResult,
    clangd: ClangdInitializeResult,
}

impl InitializeResult {
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, LspError> {
        let standard = StandardInitializeResult::deserialize(payload).map_err(|e| {
            LspError::Handshake(format!("initialize result is not a standard result: {e}"))
        })?;
        let clangd = ClangdInitializeResult::deserialize(payload).map_err(|e| {
            LspError::Handshake(format!("initialize result lacks clangd extensions: {e}"))
        })?;
        Ok(Self { standard, clangd })
    }

    #[must_use]
    pub fn standard(&self) -> &StandardInitializeResult {
        &self.standard
    }

    #[must_use]
    pub fn clangd(&self) -> &ClangdInitializeResult {
        &self.clangd
    }

    #[must_use]
    pub fn workspace_symbol_provider(&self) -> bool {
        self.standard
            .capabilities
            .workspace_symbol_provider
            .as_ref()
            .is_some_and(BoolOrOptions::is_enabled)
    }

    #[must_use]
    pub fn ast_provider(&self) -> bool {
        self.clangd.capabilities.ast_provider
    }

    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.standard.server_info.as_ref()
    }
}

/// Progress tokens are either strings or integers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub(crate) enum ProgressToken {
    Number(i64),
    String(String),
}

impl ProgressToken {
    pub fn matches(&self, token: &str) -> bool {
        matches!(self, Self::String(s) if s == token)
    }
}

/// Just enough of `$/progress` to route on the token.
#[derive(Debug, Deserialize)]
pub(crate) struct ProgressEnvelope {
    pub token: ProgressToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ProgressKind {
    Begin,
    Report,
    End,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WorkDoneProgress {
    pub kind: ProgressKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub percentage: Option<u32>,
}

/// Full `$/progress` params for a work-done progress stream.
#[derive(Debug, Deserialize)]
pub(crate) struct WorkDoneProgressParams {
    pub value: WorkDoneProgress,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WorkDoneProgressCreateParams {
    pub token: ProgressToken,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<serde_json::Value>,
}

/// clangd extension, sent when `clangdFileStatus` is enabled.
#[derive(Debug, Deserialize)]
pub(crate) struct FileStatusParams {
    pub uri: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogMessageParams {
    #[serde(rename = "type")]
    pub level: u8,
    pub message: String,
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &url::Url) -> Option<PathBuf> {
    if uri.scheme() != "file" {
        return None;
    }
    uri.to_file_path().ok()
}
