//! Public types consumed by the shell.
//!
//! The shell constructs a [`ClangdConfig`], watches [`LifecycleState`]
//! transitions, and reads back [`SymbolInformation`] rows from symbol
//! queries.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Token clangd uses for its initial workspace indexing progress stream.
pub const BACKGROUND_INDEX_TOKEN: &str = "backgroundIndexProgress";

fn default_command() -> String {
    String::from("clangd")
}

fn default_args() -> Vec<String> {
    vec![String::from("--limit-results=0")]
}

fn default_language_id() -> String {
    String::from("c")
}

fn default_client_name() -> String {
    String::from("qmk-gui")
}

fn default_client_version() -> String {
    String::from("pre-alpha")
}

fn default_locale() -> String {
    String::from("en-us")
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_stderr_poll_ms() -> u64 {
    200
}

const fn default_true() -> bool {
    true
}

/// Configuration for the clangd client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClangdConfig {
    /// Executable, resolved through `PATH`.
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// LSP language identifier sent with `didOpen`.
    #[serde(default = "default_language_id")]
    pub language_id: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Workspace folder handed to the server. The binary fills this in from
    /// its arguments when the config file leaves it out.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Display name of the workspace folder. Defaults to the root's final
    /// path component.
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How often the server's stderr is polled for log output.
    #[serde(default = "default_stderr_poll_ms")]
    pub stderr_poll_ms: u64,
    /// Ask clangd for `textDocument/clangd.fileStatus` notifications.
    #[serde(default = "default_true")]
    pub file_status: bool,
}

impl Default for ClangdConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            language_id: default_language_id(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            locale: default_locale(),
            workspace_root: None,
            workspace_name: None,
            request_timeout_secs: default_request_timeout_secs(),
            stderr_poll_ms: default_stderr_poll_ms(),
            file_status: true,
        }
    }
}

impl ClangdConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn stderr_poll_interval(&self) -> Duration {
        // A zero period would make `tokio::time::interval` panic.
        Duration::from_millis(self.stderr_poll_ms.max(1))
    }

    /// Workspace folder name, falling back to the root directory's name.
    #[must_use]
    pub fn workspace_name(&self) -> String {
        if let Some(name) = &self.workspace_name {
            return name.clone();
        }
        self.workspace_root
            .as_deref()
            .and_then(|root| root.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("workspace"))
    }
}

/// Lifecycle of an [`LspManager`](crate::LspManager).
///
/// `Failed` is absorbing: once entered, only teardown is possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Spawned,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl LifecycleState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Spawned => "spawned",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

/// One row of a `workspace/symbol` answer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInformation {
    pub name: String,
    /// LSP `SymbolKind` (1 = File … 26 = TypeParameter).
    pub kind: u32,
    pub location: Location,
    #[serde(default)]
    pub container_name: Option<String>,
    /// clangd extension: relevance of the match.
    #[serde(default)]
    pub score: Option<f64>,
}

impl SymbolInformation {
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            1 => "file",
            2 => "module",
            3 => "namespace",
            4 => "package",
            5 => "class",
            6 => "method",
            7 => "property",
            8 => "field",
            9 => "constructor",
            10 => "enum",
            11 => "interface",
            12 => "function",
            13 => "variable",
            14 => "constant",
            15 => "string",
            16 => "number",
            17 => "boolean",
            18 => "array",
            19 => "object",
            20 => "key",
            21 => "null",
            22 => "enum-member",
            23 => "struct",
            24 => "event",
            25 => "operator",
            26 => "type-parameter",
            _ => "unknown",
        }
    }
}
