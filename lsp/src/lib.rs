//! clangd client: process supervision, JSON-RPC transport, handshake,
//! document tracking and workspace symbol queries.
//!
//! [`LspManager`] is the entry point. It spawns clangd, completes the
//! `initialize` exchange, and exposes symbol queries that can optionally wait
//! for the background index to finish.

pub mod codec;
pub mod types;

pub(crate) mod protocol;
pub(crate) mod stderr;

mod client;
mod connection;
mod documents;
mod error;
mod manager;
mod process;
mod router;
mod signal;

#[cfg(test)]
mod testing;

pub use client::ClangdClient;
pub use connection::{Connection, Handler, Inbound};
pub use documents::{DocumentCollection, TextDocumentNotifier};
pub use error::{LspError, TeardownError};
pub use manager::LspManager;
pub use process::{ScopedStream, ServerProcess, ServerStderr, ServerStdin, ServerStdout};
pub use protocol::{
    BoolOrOptions, ClangdCapabilities, ClangdInitializeResult, InitializeResult, ServerInfo,
    StandardCapabilities, StandardInitializeResult,
};
pub use router::NotificationRouter;
pub use signal::IndexSignal;
pub use types::{
    BACKGROUND_INDEX_TOKEN, ClangdConfig, LifecycleState, Location, Position, Range,
    SymbolInformation,
};
