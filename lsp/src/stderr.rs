//! Turns the server's stderr into log lines.
//!
//! clangd writes its own log to stderr. The stream is polled on a fixed
//! interval, bytes are accumulated until a newline, and each complete line
//! is emitted on the `clangd` tracing target.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

const READ_CHUNK_BYTES: usize = 2048;
/// Upper bound on reading leftover output once the server has ended.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Accumulates raw bytes and yields complete lines.
///
/// Bytes are kept undecoded until a newline arrives, so a multi-byte UTF-8
/// character split across two reads is still decoded correctly.
#[derive(Debug, Default)]
pub(crate) struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            match byte {
                0 => {}
                b'\n' => {
                    if let Some(line) = self.take_line() {
                        lines.push(line);
                    }
                }
                other => self.partial.push(other),
            }
        }
        lines
    }

    /// Whatever is left without a terminating newline.
    pub fn flush(&mut self) -> Option<String> {
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        if self.partial.last() == Some(&b'\r') {
            self.partial.pop();
        }
        if self.partial.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(line)
    }
}

/// Poll `stderr` every `interval` until `done` is cancelled or the stream
/// ends, logging each complete line. Once `done` fires, whatever the server
/// wrote before exiting is drained up to EOF, and a trailing partial line is
/// flushed on the way out.
pub(crate) async fn forward_lines<R>(
    stderr: R,
    interval: Duration,
    done: CancellationToken,
    pid: u32,
) where
    R: AsyncRead + Unpin,
{
    read_lines(stderr, interval, done, |line, flush| {
        if flush {
            tracing::debug!(target: "clangd", pid, flush = true, "{line}");
        } else {
            tracing::debug!(target: "clangd", pid, "{line}");
        }
    })
    .await;
    tracing::debug!(pid, "language server stderr finished");
}

async fn read_lines<R, F>(mut stderr: R, interval: Duration, done: CancellationToken, mut emit: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String, bool),
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut assembler = LineAssembler::default();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    let mut open = true;
    while open {
        tokio::select! {
            biased;
            () = done.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let read = tokio::select! {
            biased;
            () = done.cancelled() => break,
            read = stderr.read(&mut chunk) => read,
        };
        open = accept(read, &chunk, &mut assembler, &mut emit);
    }

    if open {
        let drain = async {
            loop {
                let read = stderr.read(&mut chunk).await;
                if !accept(read, &chunk, &mut assembler, &mut emit) {
                    break;
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::debug!("stderr still open after the server ended");
        }
    }

    if let Some(line) = assembler.flush() {
        emit(line, true);
    }
}

/// Feed one read into the assembler. Returns whether the stream is still open.
fn accept<F>(
    read: std::io::Result<usize>,
    chunk: &[u8],
    assembler: &mut LineAssembler,
    emit: &mut F,
) -> bool
where
    F: FnMut(String, bool),
{
    match read {
        Ok(0) => false,
        Ok(n) => {
            for line in assembler.push(&chunk[..n]) {
                emit(line, false);
            }
            true
        }
        Err(e) => {
            tracing::debug!("stderr closed: {e}");
            false
        }
    }
}
