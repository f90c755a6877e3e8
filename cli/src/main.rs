//! qmk-symbols - look up symbols in a QMK firmware tree through clangd.
//!
//! ```text
//! qmk-symbols <firmware-dir> <source-file> [query]
//! ```
//!
//! Starts clangd rooted at the firmware directory, opens the source file,
//! waits for the background index (Ctrl-C stops waiting), prints the
//! matching workspace symbols, and shuts clangd down again.

mod config;

use std::io::{Write, stdout};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use qmk_lsp::{LspError, LspManager, SymbolInformation};

use crate::config::QmkConfig;

const USAGE: &str = "usage: qmk-symbols <firmware-dir> <source-file> [query]";

#[derive(Debug, PartialEq, Eq)]
struct Args {
    firmware_dir: PathBuf,
    source_file: PathBuf,
    query: String,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut args = args.into_iter().skip(1);
    let (Some(firmware_dir), Some(source_file)) = (args.next(), args.next()) else {
        bail!(USAGE);
    };
    let query = args.next().unwrap_or_default();
    if args.next().is_some() {
        bail!(USAGE);
    }
    Ok(Args {
        firmware_dir: PathBuf::from(firmware_dir),
        source_file: PathBuf::from(source_file),
        query,
    })
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // Results go to stdout; logs stay on stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = parse_args(std::env::args())?;

    let mut clangd = QmkConfig::load()?.clangd;
    clangd.workspace_root = Some(args.firmware_dir.clone());

    let mut manager = LspManager::new(clangd);
    let outcome = run(&mut manager, &args).await;

    // Always tear down, even after a failed run.
    let teardown = manager.shutdown().await;
    outcome?;
    teardown.context("stopping clangd")
}

async fn run(manager: &mut LspManager, args: &Args) -> Result<()> {
    manager.start().await.context("starting clangd")?;
    if let Some(pid) = manager.pid() {
        tracing::info!(pid, root = %args.firmware_dir.display(), "clangd ready");
    }

    manager
        .open_document(&args.source_file)
        .await
        .with_context(|| format!("opening {}", args.source_file.display()))?;

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    tracing::info!("waiting for clangd to finish indexing (Ctrl-C to stop waiting)");
    let symbols = match manager.find_indexed_symbols(&args.query, &cancel).await {
        Ok(symbols) => symbols,
        Err(LspError::Cancelled) => {
            tracing::warn!("stopped waiting for the index; results may be incomplete");
            manager.find_symbols(&args.query).await?
        }
        Err(e) => return Err(e.into()),
    };
    ctrl_c.abort();

    let mut out = stdout().lock();
    for symbol in &symbols {
        writeln!(out, "{}", format_row(symbol))?;
    }
    out.flush()?;

    tracing::info!(query = %args.query, count = symbols.len(), "symbol query finished");
    Ok(())
}

/// `kind name container uri:line`, with a one-based line.
fn format_row(symbol: &SymbolInformation) -> String {
    format!(
        "{:<14} {} {} {}:{}",
        symbol.kind_label(),
        symbol.name,
        symbol.container_name.as_deref().unwrap_or("-"),
        symbol.location.uri,
        symbol.location.range.start.line + 1
    )
}
