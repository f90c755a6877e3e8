//! `LspManager`: the facade over one clangd instance.
//!
//! Owns the process, the connection, the open documents and the index
//! signal, and drives them through [`LifecycleState`]. Startup failures
//! and transport loss move the manager to `Failed`; teardown is always
//! best-effort.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::ClangdClient;
use crate::connection::Connection;
use crate::documents::DocumentCollection;
use crate::error::{LspError, TeardownError};
use crate::process::ServerProcess;
use crate::protocol::{InitializeResult, path_to_file_uri};
use crate::router::NotificationRouter;
use crate::signal::IndexSignal;
use crate::stderr::forward_lines;
use crate::types::{ClangdConfig, LifecycleState, SymbolInformation};

/// Everything that exists only after a successful handshake.
struct Session {
    client: ClangdClient,
    documents: DocumentCollection,
    capabilities: InitializeResult,
}

impl Session {
    /// Wire the connection, run `initialize`, check capabilities, and send
    /// `initialized`. The connection is closed again on any failure.
    async fn establish<R, W>(
        reader: R,
        writer: W,
        config: &ClangdConfig,
        root_uri: &Url,
        index: &IndexSignal,
    ) -> Result<Self, LspError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::serve(
            reader,
            writer,
            NotificationRouter::new(index.clone()),
            config.request_timeout(),
        );
        let client = ClangdClient::new(connection.clone());

        match Self::handshake(&client, config, root_uri).await {
            Ok(capabilities) => Ok(Self {
                documents: DocumentCollection::new(client.clone(), config.language_id.clone()),
                client,
                capabilities,
            }),
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(
        client: &ClangdClient,
        config: &ClangdConfig,
        root_uri: &Url,
    ) -> Result<InitializeResult, LspError> {
        let capabilities = client.initialize(config, root_uri).await?;

        if !capabilities.ast_provider() {
            return Err(LspError::Handshake(String::from(
                "server does not provide AST support",
            )));
        }
        if !capabilities.workspace_symbol_provider() {
            return Err(LspError::Handshake(String::from(
                "server does not provide workspace symbols",
            )));
        }

        if let Some(info) = capabilities.server_info() {
            tracing::info!(
                name = %info.name,
                version = info.version.as_deref(),
                "language server initialized"
            );
        }

        client
            .initialized()
            .await
            .map_err(|e| LspError::Handshake(format!("sending initialized: {e}")))?;
        Ok(capabilities)
    }

    fn connection(&self) -> &Connection {
        self.client.connection()
    }
}

fn workspace_root_uri(config: &ClangdConfig) -> Result<Url, LspError> {
    let root = match &config.workspace_root {
        Some(root) => root.clone(),
        None => std::env::current_dir()
            .map_err(|e| LspError::Handshake(format!("no workspace root: {e}")))?,
    };
    let root = std::path::absolute(&root)
        .map_err(|e| LspError::Handshake(format!("workspace root {}: {e}", root.display())))?;
    path_to_file_uri(&root).map_err(|e| LspError::Handshake(e.to_string()))
}

fn document_uri(path: &Path) -> Result<Url, LspError> {
    let absolute: PathBuf = std::path::absolute(path).map_err(|source| LspError::DocumentIo {
        uri: path.display().to_string(),
        source,
    })?;
    path_to_file_uri(&absolute).map_err(|e| LspError::InvalidDocumentUri(e.to_string()))
}

/// Supervises clangd from spawn to teardown.
///
/// Built in `Created`; [`start`](Self::start) brings it to `Ready`. A failed
/// start leaves it in `Failed`, still observable.
pub struct LspManager {
    config: ClangdConfig,
    state: watch::Sender<LifecycleState>,
    index: IndexSignal,
    process: Option<ServerProcess>,
    stderr_task: Option<JoinHandle<()>>,
    session: Option<Session>,
}

impl LspManager {
    #[must_use]
    pub fn new(config: ClangdConfig) -> Self {
        let (state, _) = watch::channel(LifecycleState::Created);
        Self {
            config,
            state,
            index: IndexSignal::new(),
            process: None,
            stderr_task: None,
            session: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClangdConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Follow lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Move to `next` unless already `Failed`, which only teardown can
    /// follow and which is never left.
    fn transition(&self, next: LifecycleState) {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if *state == next || *state == LifecycleState::Failed {
                return false;
            }
            previous = Some(*state);
            *state = next;
            true
        });
        if let Some(previous) = previous {
            tracing::info!(from = %previous, to = %next, "lifecycle");
        }
    }

    /// Spawn clangd, complete the handshake, and reach `Ready`.
    pub async fn start(&mut self) -> Result<(), LspError> {
        let state = self.state();
        if state != LifecycleState::Created {
            return Err(LspError::NotReady { state });
        }
        let result = self.launch().await;
        if let Err(e) = &result {
            self.fail(e).await;
        }
        result
    }

    async fn launch(&mut self) -> Result<(), LspError> {
        let root_uri = workspace_root_uri(&self.config)?;

        let mut process = ServerProcess::spawn(&self.config.command, &self.config.args)?;
        let pid = process.pid();
        self.transition(LifecycleState::Spawned);

        if let Some(stderr) = process.take_diagnostics() {
            self.stderr_task = Some(tokio::spawn(forward_lines(
                stderr,
                self.config.stderr_poll_interval(),
                process.lifetime(),
                pid,
            )));
        }
        let transport = process.take_transport();
        self.process = Some(process);
        let (stdout, stdin) = transport.ok_or_else(|| LspError::Spawn {
            command: self.config.command.clone(),
            reason: String::from("transport already taken"),
        })?;

        self.handshake(stdout, stdin, &root_uri).await
    }

    async fn handshake<R, W>(&mut self, reader: R, writer: W, root_uri: &Url) -> Result<(), LspError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.transition(LifecycleState::Handshaking);
        let session =
            Session::establish(reader, writer, &self.config, root_uri, &self.index).await?;
        self.session = Some(session);
        self.transition(LifecycleState::Ready);
        Ok(())
    }

    /// Start over an already-connected transport instead of a process.
    #[cfg(test)]
    pub(crate) async fn start_with_transport<R, W>(
        &mut self,
        reader: R,
        writer: W,
    ) -> Result<(), LspError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let result = match workspace_root_uri(&self.config) {
            Ok(root_uri) => {
                self.transition(LifecycleState::Spawned);
                self.handshake(reader, writer, &root_uri).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.fail(e).await;
        }
        result
    }

    async fn fail(&mut self, err: &LspError) {
        tracing::error!("language server startup failed: {err}");
        if let Err(e) = self.release().await {
            tracing::warn!("{e}");
        }
        self.transition(LifecycleState::Failed);
    }

    /// Stop the connection, the process and the stderr poller, in that
    /// order. Every step runs.
    async fn release(&mut self) -> Result<(), TeardownError> {
        let mut teardown = TeardownError::default();
        if let Some(session) = self.session.take() {
            session.connection().close().await;
        }
        if let Some(mut process) = self.process.take()
            && let Err(e) = process.close().await
        {
            teardown.push(format!("stopping process: {e}"));
        }
        if let Some(task) = self.stderr_task.take()
            && let Err(e) = task.await
        {
            teardown.push(format!("stderr poller: {e}"));
        }
        teardown.into_result()
    }

    fn ready_session(&self) -> Result<&Session, LspError> {
        let state = self.state();
        let session = match (state, &self.session) {
            (LifecycleState::Ready, Some(session)) => session,
            _ => return Err(LspError::NotReady { state }),
        };
        if session.connection().is_closed() {
            tracing::error!("connection to language server lost");
            self.transition(LifecycleState::Failed);
            return Err(LspError::Transport(String::from(
                "connection to language server closed",
            )));
        }
        Ok(session)
    }

    /// Fatal results end the lifecycle.
    fn observe<T>(&self, result: Result<T, LspError>) -> Result<T, LspError> {
        if let Err(e) = &result
            && e.is_fatal()
        {
            tracing::error!("{e}");
            self.transition(LifecycleState::Failed);
        }
        result
    }

    pub async fn open_document(&self, path: &Path) -> Result<(), LspError> {
        let session = self.ready_session()?;
        let uri = document_uri(path)?;
        self.observe(session.documents.open(&uri).await)
    }

    pub async fn close_document(&self, path: &Path) -> Result<(), LspError> {
        let session = self.ready_session()?;
        let uri = document_uri(path)?;
        self.observe(session.documents.close(&uri).await)
    }

    /// Documents currently open on the server.
    pub async fn open_documents(&self) -> Result<Vec<Url>, LspError> {
        Ok(self.ready_session()?.documents.uris().await)
    }

    /// Query workspace symbols now. Before indexing finishes the answer may
    /// be partial.
    pub async fn find_symbols(&self, query: &str) -> Result<Vec<SymbolInformation>, LspError> {
        let session = self.ready_session()?;
        self.observe(session.client.find_symbols(query).await)
    }

    /// Wait for clangd to finish its initial background index.
    ///
    /// Returns `Cancelled` if `cancel` fires first and `Transport` if the
    /// server goes away first.
    pub async fn wait_for_index(&self, cancel: &CancellationToken) -> Result<(), LspError> {
        let session = self.ready_session()?;
        tokio::select! {
            biased;
            () = self.index.wait() => Ok(()),
            () = cancel.cancelled() => Err(LspError::Cancelled),
            () = session.connection().closed() => self.observe(Err(LspError::Transport(
                String::from("language server exited before indexing finished"),
            ))),
        }
    }

    /// [`wait_for_index`](Self::wait_for_index), then
    /// [`find_symbols`](Self::find_symbols).
    pub async fn find_indexed_symbols(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SymbolInformation>, LspError> {
        self.wait_for_index(cancel).await?;
        self.find_symbols(query).await
    }

    #[must_use]
    pub fn index_ready(&self) -> bool {
        self.index.is_published()
    }

    /// The merged `initialize` result, once the handshake has succeeded.
    #[must_use]
    pub fn capabilities(&self) -> Option<&InitializeResult> {
        self.session.as_ref().map(|session| &session.capabilities)
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ServerProcess::pid)
    }

    /// Close documents, run `shutdown` and `exit`, then stop the connection
    /// and the process.
    ///
    /// Every step is attempted. Failures are returned together once the
    /// process has been stopped. Outside `Ready` only resources are released.
    pub async fn shutdown(&mut self) -> Result<(), LspError> {
        let state = self.state();
        if state == LifecycleState::Closed {
            return Ok(());
        }

        let mut teardown = TeardownError::default();
        if state == LifecycleState::Ready
            && let Some(session) = &self.session
        {
            self.transition(LifecycleState::Closing);

            match session.documents.close_all().await {
                Ok(()) => {}
                Err(LspError::Teardown(failures)) => {
                    for failure in failures.failures() {
                        teardown.push(failure.clone());
                    }
                }
                Err(e) => teardown.push(e.to_string()),
            }
            if let Err(e) = session.client.shutdown().await {
                tracing::warn!("shutdown request failed: {e}");
                teardown.push(format!("shutdown: {e}"));
            }
            if let Err(e) = session.client.exit().await {
                tracing::warn!("exit notification failed: {e}");
                teardown.push(format!("exit: {e}"));
            }
        }

        if let Err(released) = self.release().await {
            for failure in released.failures() {
                teardown.push(failure.clone());
            }
        }
        self.transition(LifecycleState::Closed);

        teardown.into_result().map_err(|e| {
            tracing::warn!("{e}");
            LspError::from(e)
        })
    }
}
