//! Language server process supervisor.
//!
//! The child and its three pipes live inside one cancellable lifetime scope.
//! Either path out of that scope (explicit `close()`, or the process exiting
//! by itself and the watchdog noticing) cancels the same token, so `done()`
//! resolves once for every waiter no matter which path won.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::LspError;

/// How long a closed server gets to exit by itself before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn lifetime_ended() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "language server lifetime ended")
}

/// A pipe end bound to the process lifetime.
///
/// Once the lifetime is cancelled the pipe is dropped and every pending or
/// later read/write fails with `BrokenPipe`. The diagnostic stream is the
/// exception: it stays readable after cancellation so the last output of a
/// dying server can still be read up to EOF.
pub struct ScopedStream<S> {
    inner: Option<S>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    release_on_cancel: bool,
}

impl<S> ScopedStream<S> {
    fn new(inner: S, lifetime: &CancellationToken) -> Self {
        Self {
            inner: Some(inner),
            cancelled: Box::pin(lifetime.clone().cancelled_owned()),
            release_on_cancel: true,
        }
    }

    fn lingering(inner: S, lifetime: &CancellationToken) -> Self {
        Self {
            release_on_cancel: false,
            ..Self::new(inner, lifetime)
        }
    }

    fn live(&mut self, cx: &mut Context<'_>) -> Option<&mut S> {
        if self.release_on_cancel
            && self.inner.is_some()
            && self.cancelled.as_mut().poll(cx).is_ready()
        {
            self.inner = None;
        }
        self.inner.as_mut()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ScopedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().live(cx) {
            Some(inner) => Pin::new(inner).poll_read(cx, buf),
            None => Poll::Ready(Err(lifetime_ended())),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ScopedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().live(cx) {
            Some(inner) => Pin::new(inner).poll_write(cx, buf),
            None => Poll::Ready(Err(lifetime_ended())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().live(cx) {
            Some(inner) => Pin::new(inner).poll_flush(cx),
            None => Poll::Ready(Err(lifetime_ended())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // A pipe dropped by cancellation is already closed.
        match self.get_mut().live(cx) {
            Some(inner) => Pin::new(inner).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

pub type ServerStdin = ScopedStream<ChildStdin>;
pub type ServerStdout = ScopedStream<ChildStdout>;
pub type ServerStderr = ScopedStream<ChildStderr>;

/// Owns the language server child process.
///
/// Must be created inside a Tokio runtime.
pub struct ServerProcess {
    pid: u32,
    lifetime: CancellationToken,
    stdin: Option<ServerStdin>,
    stdout: Option<ServerStdout>,
    stderr: Option<ServerStderr>,
    watchdog: Option<JoinHandle<Option<ExitStatus>>>,
}

impl ServerProcess {
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, LspError> {
        let spawn_error = |reason: String| LspError::Spawn {
            command: command.to_string(),
            reason,
        };

        let resolved = which::which(command)
            .map_err(|e| spawn_error(format!("not found in PATH: {e}")))?;

        let lifetime = CancellationToken::new();

        // All three pipes are attached before the process starts.
        let mut cmd = Command::new(&resolved);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                lifetime.cancel();
                return Err(spawn_error(e.to_string()));
            }
        };

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            lifetime.cancel();
            // kill_on_drop reaps the child when it goes out of scope.
            return Err(spawn_error(String::from("stdio pipes were not captured")));
        };
        let Some(pid) = child.id() else {
            lifetime.cancel();
            return Err(spawn_error(String::from("process exited during startup")));
        };

        let watchdog = tokio::spawn(watchdog(child, lifetime.clone(), pid));
        tracing::info!(pid, command = %resolved.display(), ?args, "language server started");

        Ok(Self {
            pid,
            stdin: Some(ScopedStream::new(stdin, &lifetime)),
            stdout: Some(ScopedStream::new(stdout, &lifetime)),
            stderr: Some(ScopedStream::lingering(stderr, &lifetime)),
            lifetime,
            watchdog: Some(watchdog),
        })
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Hand the RPC transport (`stdout` to read, `stdin` to write) to its
    /// owner. Returns `None` after the first call.
    pub fn take_transport(&mut self) -> Option<(ServerStdout, ServerStdin)> {
        match (self.stdout.take(), self.stdin.take()) {
            (Some(stdout), Some(stdin)) => Some((stdout, stdin)),
            (stdout, stdin) => {
                self.stdout = stdout;
                self.stdin = stdin;
                None
            }
        }
    }

    /// Hand the diagnostic stream (`stderr`) to its reader. Returns `None`
    /// after the first call.
    ///
    /// Unlike the transport, this stream is not released when the lifetime
    /// ends; it reads until the process side of the pipe closes.
    pub fn take_diagnostics(&mut self) -> Option<ServerStderr> {
        self.stderr.take()
    }

    /// Resolves once the process is no longer running, for any reason.
    #[must_use]
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.lifetime.clone().cancelled_owned()
    }

    /// A handle on the lifetime scope for tasks that outlive a borrow of
    /// the process.
    pub(crate) fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// End the lifetime scope, then release every stream and reap the child.
    ///
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned.
    pub async fn close(&mut self) -> Result<(), LspError> {
        self.lifetime.cancel();

        let mut first_error = None;

        if let Some(mut stdin) = self.stdin.take()
            && let Err(e) = stdin.shutdown().await
        {
            first_error.get_or_insert(LspError::Transport(format!("closing stdin: {e}")));
        }
        drop(self.stdout.take());
        drop(self.stderr.take());

        if let Some(watchdog) = self.watchdog.take() {
            match watchdog.await {
                Ok(Some(status)) => tracing::debug!(pid = self.pid, %status, "language server reaped"),
                Ok(None) => {}
                Err(e) => {
                    first_error
                        .get_or_insert(LspError::Transport(format!("process watchdog failed: {e}")));
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

/// Waits for the child to exit or the lifetime to be cancelled, whichever
/// comes first, and converges both on a cancelled lifetime.
async fn watchdog(mut child: Child, lifetime: CancellationToken, pid: u32) -> Option<ExitStatus> {
    tokio::select! {
        status = child.wait() => {
            match &status {
                Ok(status) => tracing::info!(pid, %status, "language server exited"),
                Err(e) => tracing::warn!(pid, "waiting on language server failed: {e}"),
            }
            lifetime.cancel();
            status.ok()
        }
        () = lifetime.cancelled() => {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    tracing::warn!(pid, "waiting on language server failed: {e}");
                    None
                }
                Err(_) => {
                    tracing::debug!(pid, "language server didn't exit in time, killing");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(pid, "killing language server failed: {e}");
                    }
                    child.try_wait().ok().flatten()
                }
            }
        }
    }
}
